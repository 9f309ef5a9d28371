//! Kernel logger.
//!
//! Log records are formatted at the call site into a fixed-size slot of
//! a lock-free ring (bounded MPMC, sequence-stamped slots), so logging
//! is safe from interrupt handlers and never takes the serial lock.
//! Flushing is deferred: a drain pass moves completed records to the
//! sink (the serial port on bare metal). Records that cannot claim a
//! slot because the ring lapped are counted, not blocked on.

use core::cell::UnsafeCell;
use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use log::{LevelFilter, Metadata, Record as LogRecord};

/// Payload bytes per ring slot; longer messages are truncated.
pub const RECORD_BYTES: usize = 184;

/// Slots in the ring.
const RING_CAPACITY: usize = 256;

struct Slot {
    sequence: AtomicUsize,
    len: UnsafeCell<usize>,
    bytes: UnsafeCell<[u8; RECORD_BYTES]>,
}

/// Bounded multi-producer ring of formatted records.
pub struct RingLog {
    slots: Box<[Slot]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

// Slots are only written by the producer that claimed them through the
// sequence protocol.
unsafe impl Sync for RingLog {}
unsafe impl Send for RingLog {}

impl RingLog {
    pub fn with_capacity(capacity: usize) -> RingLog {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|index| Slot {
                sequence: AtomicUsize::new(index),
                len: UnsafeCell::new(0),
                bytes: UnsafeCell::new([0; RECORD_BYTES]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        RingLog {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Append one formatted record. Never blocks; on a lapped ring the
    /// record is dropped and counted.
    pub fn push(&self, args: fmt::Arguments<'_>) {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask()];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Claimed: format into the slot, then publish.
                        let mut writer = SlotWriter {
                            // SAFETY: the sequence protocol gives this
                            // producer exclusive slot access.
                            bytes: unsafe { &mut *slot.bytes.get() },
                            len: 0,
                        };
                        let _ = writer.write_fmt(args);
                        let len = writer.len;
                        // SAFETY: as above.
                        unsafe { *slot.len.get() = len };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return;
                    }
                    Err(current) => pos = current,
                }
            } else if sequence < pos + 1 {
                // The consumer has not freed this slot: ring is full.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Drain completed records into `sink` in order.
    pub fn drain(&self, mut sink: impl FnMut(&str)) {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[pos & self.mask()];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence != pos + 1 {
                return;
            }
            if self
                .tail
                .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // SAFETY: sequence == pos + 1 means the producer published;
            // the tail CAS gives this consumer exclusive drain rights.
            let (len, bytes) = unsafe { (*slot.len.get(), &*slot.bytes.get()) };
            if let Ok(text) = core::str::from_utf8(&bytes[..len]) {
                sink(text);
            }
            slot.sequence
                .store(pos + self.slots.len(), Ordering::Release);
        }
    }

    /// Records lost to ring overruns since boot.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Truncating formatter over a slot's byte array.
struct SlotWriter<'a> {
    bytes: &'a mut [u8; RECORD_BYTES],
    len: usize,
}

impl fmt::Write for SlotWriter<'_> {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        let room = RECORD_BYTES - self.len;
        let take = text.len().min(room);
        // Cut on a char boundary when truncating.
        let take = (0..=take)
            .rev()
            .find(|&cut| text.is_char_boundary(cut))
            .unwrap_or(0);
        self.bytes[self.len..self.len + take].copy_from_slice(&text.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

lazy_static! {
    /// The global ring every `log` macro lands in.
    pub static ref LOG_RING: RingLog = RingLog::with_capacity(RING_CAPACITY);
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &LogRecord<'_>) {
        LOG_RING.push(format_args!(
            "[{:>5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        flush();
    }
}

/// Install the ring logger behind the `log` facade.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Drain the ring to the serial sink.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn flush() {
    use spin::Mutex;
    use uart_16550::SerialPort;

    static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

    let mut serial = SERIAL.lock();
    let port = serial.get_or_insert_with(|| {
        // SAFETY: COM1 is the standard debug port address.
        let mut port = unsafe { SerialPort::new(0x3f8) };
        port.init();
        port
    });

    LOG_RING.drain(|text| {
        let _ = writeln!(port, "{}", text);
    });
}

/// On the host the ring is drained by tests; flushing is a no-op.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn flush() {}
