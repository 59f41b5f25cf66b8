//! Ordered stream of audio packets from one sender.
//!
//! UDP hands us packets late, twice, out of order or not at all.  A [`PacketStreamQueue`]
//! takes them in any order and hands them out strictly by message counter.  When the next
//! counter is missing it makes one up: from the FEC copy carried by the packet after the
//! hole if it has one, otherwise by repeating the last block played.  After one made up
//! packet in a row it gives up on the hole, emits silence and jumps ahead to what it has.
//!
//! The accept thread pushes while the mixer pops, so all of this sits behind a short lock.
//! [`PacketStreamQueue::size`] is an atomic so the mixer can check depths without it.
use log::trace;
use parking_lot::Mutex;
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use super::{
    client_info::StreamQualityInfo,
    get_milli_time,
    jam_packet::{AudioBlock, AudioData},
    stream_time_stat::RunningStat,
};

/// consecutive made up packets before we stop repeating and jump over the hole
pub const MAX_CONSECUTIVE_FILL_INS: u64 = 1;
/// roughly 30 seconds of packets at 375/s
pub const JITTER_WINDOW_PACKETS: u64 = 11_250;

/// heap entry, lowest counter comes out first
struct Pending {
    counter: u64,
    data: AudioData,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.counter == other.counter
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.counter.cmp(&self.counter)
    }
}

struct StreamState {
    heap: BinaryHeap<Pending>,
    enqueued: HashSet<u64>,
    last_pushed: Option<u64>,
    last_popped: Option<u64>,
    last_popped_block: Option<Arc<AudioBlock>>,
    current_gap: u64,
    clock_delta: RunningStat,
    jitter: RunningStat,
}

/// Counters, readable from any thread without taking the queue lock
#[derive(Default)]
struct StreamQualityData {
    too_late_or_duplicate: AtomicU64,
    dropped: AtomicI64,
    out_of_order: AtomicI64,
    duplicate: AtomicI64,
    healed: AtomicU64,
    pushed: AtomicU64,
    popped: AtomicU64,
    max_gap: AtomicU64,
    max_wrong_order_span: AtomicU64,
    wall_clock_delta: AtomicU64,
    jitter_mean: AtomicU64,
    jitter_sd: AtomicU64,
}

pub struct PacketStreamQueue {
    name: String,
    state: Mutex<StreamState>,
    len: AtomicUsize,
    quality: StreamQualityData,
}

impl PacketStreamQueue {
    pub fn new(name: &str) -> PacketStreamQueue {
        PacketStreamQueue {
            name: name.to_string(),
            state: Mutex::new(StreamState {
                heap: BinaryHeap::new(),
                enqueued: HashSet::new(),
                last_pushed: None,
                last_popped: None,
                last_popped_block: None,
                current_gap: 0,
                clock_delta: RunningStat::new(),
                jitter: RunningStat::new(),
            }),
            len: AtomicUsize::new(0),
            quality: StreamQualityData::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a packet that just arrived.  Returns false if it was thrown away.
    pub fn push(&self, packet: AudioData) -> bool {
        self.push_at(packet, get_milli_time())
    }

    /// push with an explicit arrival time in milliseconds
    pub fn push_at(&self, packet: AudioData, now_ms: f64) -> bool {
        let counter = packet.message_counter();
        let mut state = self.state.lock();
        if let Some(last_popped) = state.last_popped {
            if counter <= last_popped {
                self.quality.too_late_or_duplicate.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if state.enqueued.contains(&counter) {
            self.quality.duplicate.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some(last_pushed) = state.last_pushed {
            if counter < last_pushed {
                self.quality.out_of_order.fetch_add(1, Ordering::Relaxed);
                self.quality
                    .max_wrong_order_span
                    .fetch_max(last_pushed - counter, Ordering::Relaxed);
            }
        }
        state.last_pushed = Some(counter);
        self.update_jitter(&mut state, now_ms - packet.timestamp());
        state.enqueued.insert(counter);
        state.heap.push(Pending { counter, data: packet });
        self.len.store(state.heap.len(), Ordering::Release);
        self.quality.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn update_jitter(&self, state: &mut StreamState, clock_delta: f64) {
        if state.clock_delta.count() >= JITTER_WINDOW_PACKETS {
            state.clock_delta.clear();
            state.jitter.clear();
        }
        if state.clock_delta.count() > 0 {
            let jitter = (clock_delta - state.clock_delta.mean()).abs();
            state.jitter.push(jitter);
        }
        state.clock_delta.push(clock_delta);
        store_f64(&self.quality.wall_clock_delta, state.clock_delta.mean());
        store_f64(&self.quality.jitter_mean, state.jitter.mean());
        store_f64(&self.quality.jitter_sd, state.jitter.std_dev());
    }

    /// Next packet in order.  The bool is true when the packet was made up to cover a hole.
    pub fn try_pop(&self) -> Option<(AudioData, bool)> {
        let mut state = self.state.lock();
        let packet = state.heap.pop()?.data;
        let counter = packet.message_counter();
        let in_order = match state.last_popped {
            None => true,
            Some(last) => counter == last + 1,
        };
        if in_order {
            state.enqueued.remove(&counter);
            state.last_popped = Some(counter);
            state.last_popped_block = Some(packet.audio_block());
            state.current_gap = 0;
            self.len.store(state.heap.len(), Ordering::Release);
            self.quality.popped.fetch_add(1, Ordering::Relaxed);
            return Some((packet, false));
        }

        // there is a hole in front of this packet
        let last_popped = state.last_popped.unwrap_or(0);
        let fill_in = if state.current_gap < MAX_CONSECUTIVE_FILL_INS {
            let missing = last_popped + 1;
            match packet.fill_in_from_fec(missing) {
                Some(healed) => {
                    self.quality.healed.fetch_add(1, Ordering::Relaxed);
                    healed
                }
                None => {
                    self.quality.dropped.fetch_add(1, Ordering::Relaxed);
                    let repeat = match &state.last_popped_block {
                        Some(block) => block.renumbered(missing),
                        None => packet.audio_block().silent(missing),
                    };
                    AudioData::new(Arc::new(repeat), None)
                }
            }
        } else {
            // silence for the whole span we could not recover
            let skip_to = counter - 1;
            self.quality
                .dropped
                .fetch_add((skip_to - last_popped) as i64, Ordering::Relaxed);
            AudioData::new(Arc::new(packet.audio_block().silent(skip_to)), None)
        };
        trace!("{}: filling in {} before {}", self.name, fill_in.message_counter(), counter);
        state.heap.push(Pending { counter, data: packet });
        state.last_popped = Some(fill_in.message_counter());
        state.current_gap += 1;
        self.quality.max_gap.fetch_max(state.current_gap, Ordering::Relaxed);
        Some((fill_in, true))
    }

    /// packets waiting, no lock taken
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn quality_info(&self) -> StreamQualityInfo {
        let q = &self.quality;
        StreamQualityInfo {
            too_late_or_duplicate: q.too_late_or_duplicate.load(Ordering::Relaxed),
            dropped_packet_counter: q.dropped.load(Ordering::Relaxed),
            out_of_order_packet_counter: q.out_of_order.load(Ordering::Relaxed),
            duplicate_packet_counter: q.duplicate.load(Ordering::Relaxed),
            drops_healed: q.healed.load(Ordering::Relaxed),
            packages_pushed: q.pushed.load(Ordering::Relaxed),
            packages_popped: q.popped.load(Ordering::Relaxed),
            max_length_of_gap: q.max_gap.load(Ordering::Relaxed),
            max_wrong_order_span: q.max_wrong_order_span.load(Ordering::Relaxed),
            wall_clock_delta: load_f64(&q.wall_clock_delta),
            jitter_mean_millis: load_f64(&q.jitter_mean),
            jitter_sd_millis: load_f64(&q.jitter_sd),
        }
    }

    /// one line for the log
    pub fn quality_statement(&self) -> String {
        let q = self.quality_info();
        format!(
            "{}: {} dropped ({} healed), {} late, {} duplicates, {} out of order (max span {}), max gap {}, jitter {:.2}ms +/- {:.2}, clock delta {:.1}ms",
            self.name,
            q.dropped_packet_counter,
            q.drops_healed,
            q.too_late_or_duplicate,
            q.duplicate_packet_counter,
            q.out_of_order_packet_counter,
            q.max_wrong_order_span,
            q.max_length_of_gap,
            q.jitter_mean_millis,
            q.jitter_sd_millis,
            q.wall_clock_delta
        )
    }
}

impl fmt::Display for PacketStreamQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ name: {}, size: {}, quality: {} }}", self.name, self.size(), self.quality_info())
    }
}

fn store_f64(slot: &AtomicU64, v: f64) {
    slot.store(v.to_bits(), Ordering::Relaxed);
}

fn load_f64(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(Ordering::Relaxed))
}

#[cfg(test)]
mod test_packet_stream {
    use super::*;
    use crate::common::jam_packet::ChannelSetup;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn block(counter: u64, level: f32) -> Arc<AudioBlock> {
        Arc::new(AudioBlock::new(
            counter as f64 * 2.667,
            counter,
            48_000,
            ChannelSetup::mono(),
            vec![vec![level; 8]],
        ))
    }

    fn packet(counter: u64) -> AudioData {
        AudioData::new(block(counter, counter as f32 / 100.0), None)
    }

    fn packet_with_fec(counter: u64) -> AudioData {
        AudioData::new(
            block(counter, counter as f32 / 100.0),
            Some(block(counter - 1, (counter - 1) as f32 / 100.0)),
        )
    }

    fn drain(queue: &PacketStreamQueue) -> Vec<(u64, bool)> {
        let mut out = vec![];
        while let Some((p, fill)) = queue.try_pop() {
            out.push((p.message_counter(), fill));
        }
        out
    }

    #[test]
    fn shuffled_with_duplicates() {
        // It should come out in order with every counter exactly once
        let mut counters: Vec<u64> = (0..200).collect();
        counters.extend(10..30);
        counters.shuffle(&mut StdRng::seed_from_u64(7));
        let queue = PacketStreamQueue::new("shuffle");
        for c in counters {
            queue.push_at(packet(c), 0.0);
        }
        assert_eq!(queue.size(), 200);
        let out = drain(&queue);
        assert_eq!(out, (0..200).map(|c| (c, false)).collect::<Vec<_>>());
        let q = queue.quality_info();
        assert_eq!(q.duplicate_packet_counter, 20);
        assert_eq!(q.packages_pushed, 200);
        assert_eq!(q.packages_popped, 200);
        assert!(q.out_of_order_packet_counter > 0);
        assert!(queue.is_empty());
    }
    #[test]
    fn duplicate_rejected() {
        let queue = PacketStreamQueue::new("dup");
        assert!(queue.push_at(packet(5), 0.0));
        assert!(!queue.push_at(packet(5), 0.0));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.quality_info().duplicate_packet_counter, 1);
    }
    #[test]
    fn late_rejected() {
        // It should not take anything at or behind what has been played
        let queue = PacketStreamQueue::new("late");
        queue.push_at(packet(10), 0.0);
        queue.push_at(packet(11), 0.0);
        queue.try_pop();
        queue.try_pop();
        assert!(!queue.push_at(packet(3), 0.0));
        assert!(!queue.push_at(packet(11), 0.0));
        assert_eq!(queue.quality_info().too_late_or_duplicate, 2);
        assert!(queue.push_at(packet(12), 0.0));
    }
    #[test]
    fn single_hole_healed_by_fec() {
        let queue = PacketStreamQueue::new("fec");
        queue.push_at(packet(0), 0.0);
        queue.push_at(packet_with_fec(2), 0.0);
        assert_eq!(drain(&queue), vec![(0, false), (1, true), (2, false)]);
        let q = queue.quality_info();
        assert_eq!(q.drops_healed, 1);
        assert_eq!(q.dropped_packet_counter, 0);
        assert_eq!(q.max_length_of_gap, 1);
    }
    #[test]
    fn single_hole_without_fec_repeats() {
        // It should repeat the last block it played under the missing counter
        let queue = PacketStreamQueue::new("repeat");
        queue.push_at(packet(0), 0.0);
        queue.push_at(packet(1), 0.0);
        queue.push_at(packet(3), 0.0);
        queue.try_pop();
        queue.try_pop();
        let (fill, is_fill) = queue.try_pop().unwrap();
        assert!(is_fill);
        assert_eq!(fill.message_counter(), 2);
        assert_eq!(fill.audio_block().audio[0][0], 0.01);
        let (real, is_fill) = queue.try_pop().unwrap();
        assert!(!is_fill);
        assert_eq!(real.message_counter(), 3);
        assert_eq!(queue.quality_info().dropped_packet_counter, 1);
        assert_eq!(queue.quality_info().drops_healed, 0);
    }
    #[test]
    fn two_missing() {
        // It should repeat once, then silence, then carry on
        let queue = PacketStreamQueue::new("two");
        queue.push_at(packet(0), 0.0);
        queue.push_at(packet(3), 0.0);
        let out = drain(&queue);
        assert_eq!(out, vec![(0, false), (1, true), (2, true), (3, false)]);
        assert_eq!(queue.quality_info().dropped_packet_counter, 2);
        assert_eq!(queue.quality_info().max_length_of_gap, 2);
    }
    #[test]
    fn long_hole_is_skipped_in_silence() {
        let queue = PacketStreamQueue::new("long");
        queue.push_at(packet(0), 0.0);
        queue.push_at(packet(10), 0.0);
        queue.try_pop();
        assert_eq!(queue.try_pop().unwrap().0.message_counter(), 1);
        let (silence, is_fill) = queue.try_pop().unwrap();
        assert!(is_fill);
        assert_eq!(silence.message_counter(), 9);
        assert_eq!(silence.audio_block().audio[0][0], 0.0);
        assert_eq!(queue.try_pop().unwrap().0.message_counter(), 10);
        // one repeated plus the eight skipped
        assert_eq!(queue.quality_info().dropped_packet_counter, 9);
    }
    #[test]
    fn zero_one_three() {
        let queue = PacketStreamQueue::new("013");
        for c in [0, 1, 3] {
            queue.push_at(packet(c), 0.0);
        }
        assert_eq!(drain(&queue), vec![(0, false), (1, false), (2, true), (3, false)]);
    }
    #[test]
    fn first_pop_takes_anything() {
        let queue = PacketStreamQueue::new("first");
        queue.push_at(packet(57), 0.0);
        assert_eq!(queue.try_pop().unwrap(), (packet(57), false));
        assert!(queue.try_pop().is_none());
    }
    #[test]
    fn jitter_tracking() {
        // It should see steady arrival as no jitter and uneven arrival as some
        let steady = PacketStreamQueue::new("steady");
        for c in 0..50u64 {
            steady.push_at(packet(c), c as f64 * 2.667 + 20.0);
        }
        let q = steady.quality_info();
        assert!((q.wall_clock_delta - 20.0).abs() < 1e-6);
        assert!(q.jitter_mean_millis < 1e-6);

        let bumpy = PacketStreamQueue::new("bumpy");
        for c in 0..50u64 {
            let wobble = if c % 2 == 0 { 5.0 } else { 0.0 };
            bumpy.push_at(packet(c), c as f64 * 2.667 + 20.0 + wobble);
        }
        assert!(bumpy.quality_info().jitter_mean_millis > 1.0);
        assert!(bumpy.quality_statement().starts_with("bumpy:"));
    }
}
