//! Transaction system calls.
//!
//! The transaction object is pure API surface: it carries a name and
//! the requested isolation modes and settles exactly once. The backing
//! store that would give the modes meaning is a collaborator.

use alloc::sync::Arc;

use super::CallContext;
use crate::error::{OsResult, OsStatus};
use crate::object::{HandleAccess, HandleType, ObjectRef, OsHandle, Transaction};

/// Highest isolation value: {serializable 0, committed 1, uncommitted 2}.
const ISOLATION_MAX: u64 = 2;

/// 0x50: begin a transaction and mint its handle.
pub fn transaction_begin(
    call: &CallContext,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    let name = call.read_name(arg0, arg1)?;

    let mode = arg2;
    if mode >> 4 != 0 || mode & 0b11 > ISOLATION_MAX || (mode >> 2) & 0b11 > ISOLATION_MAX {
        return Err(OsStatus::InvalidInput);
    }

    let tx = Arc::new(Transaction::new(name, mode));
    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Tx(tx), HandleAccess::ALL);
    Ok(minted.raw())
}

fn transaction_of(call: &CallContext, raw: u64) -> OsResult<Arc<Transaction>> {
    let entry = call
        .process
        .handles()
        .get_typed(OsHandle(raw), HandleType::Tx)?;
    match &entry.object {
        ObjectRef::Tx(tx) => Ok(tx.clone()),
        _ => Err(OsStatus::InvalidType),
    }
}

/// 0x51: commit.
pub fn transaction_commit(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    transaction_of(call, arg0)?.commit()?;
    Ok(0)
}

/// 0x52: roll back.
pub fn transaction_rollback(
    call: &CallContext,
    arg0: u64,
    _arg1: u64,
    _arg2: u64,
    _arg3: u64,
) -> OsResult<u64> {
    transaction_of(call, arg0)?.rollback()?;
    Ok(0)
}
