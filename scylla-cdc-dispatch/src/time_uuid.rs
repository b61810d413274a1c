//! Conversions between millisecond timestamps and the time-UUIDs that bound
//! a read window.
//!
//! Scylla orders `cdc$time` by the 60-bit count of 100 ns intervals since
//! the UUID epoch, then by the clock-seq-and-node half compared as signed
//! bytes. The bounds produced here are the extreme UUIDs of a given
//! millisecond under that ordering.

use scylla::value::CqlTimeuuid;
use uuid::Uuid;

// Milliseconds between the UUID epoch (1582-10-15) and the Unix epoch.
const UUID_UNIX_OFFSET_MILLIS: i64 = 12_219_292_800_000;
// 100 ns intervals per millisecond.
const TICKS_PER_MILLI: i64 = 10_000;

// Extreme clock-seq-and-node halves under signed-byte comparison.
const MIN_CLOCK_SEQ_AND_NODE: u64 = 0x8080_8080_8080_8080;
const MAX_CLOCK_SEQ_AND_NODE: u64 = 0x7f7f_7f7f_7f7f_7f7f;

fn ticks_from_unix_millis(millis: i64) -> u64 {
    ((millis + UUID_UNIX_OFFSET_MILLIS) * TICKS_PER_MILLI) as u64
}

// Spreads a 60-bit tick count into the version-1 UUID msb layout.
fn msb_for_ticks(ticks: u64) -> u64 {
    let mut msb = 0u64;
    msb |= (ticks & 0x0000_0000_ffff_ffff) << 32;
    msb |= (ticks & 0x0000_ffff_0000_0000) >> 16;
    msb |= (ticks & 0x0fff_0000_0000_0000) >> 48;
    msb | 0x1000
}

fn ticks_of(uuid: &Uuid) -> u64 {
    let (msb, _) = uuid.as_u64_pair();
    ((msb & 0x0fff) << 48) | (((msb >> 16) & 0xffff) << 32) | (msb >> 32)
}

/// The smallest time-UUID whose embedded millisecond equals `millis`.
pub fn start_of(millis: i64) -> CqlTimeuuid {
    let uuid = Uuid::from_u64_pair(
        msb_for_ticks(ticks_from_unix_millis(millis)),
        MIN_CLOCK_SEQ_AND_NODE,
    );
    CqlTimeuuid::from(uuid)
}

/// The largest time-UUID whose embedded millisecond equals `millis`.
pub fn end_of(millis: i64) -> CqlTimeuuid {
    let ticks = ticks_from_unix_millis(millis + 1) - 1;
    let uuid = Uuid::from_u64_pair(msb_for_ticks(ticks), MAX_CLOCK_SEQ_AND_NODE);
    CqlTimeuuid::from(uuid)
}

/// Projects the embedded wall-clock millisecond out of a time-UUID.
pub fn embedded_millis(uuid: &CqlTimeuuid) -> i64 {
    let ticks = ticks_of(&Uuid::from(*uuid));
    (ticks as i64) / TICKS_PER_MILLI - UUID_UNIX_OFFSET_MILLIS
}
