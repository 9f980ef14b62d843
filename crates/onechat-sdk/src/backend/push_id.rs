//! Push id 生成器
//!
//! 20 个字符：前 8 位是毫秒时间戳，后 12 位随机。同一毫秒内随机部分加一，
//! 因此 id 的字典序与生成顺序一致，可以直接作为有序存储的 key。

use parking_lot::Mutex;
use rand::Rng;

use crate::message::MessageId;
use crate::utils::now_millis;

/// 按 ASCII 升序排列的 64 个字符
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_LEN: usize = 8;
const RANDOM_LEN: usize = 12;

#[derive(Default)]
struct GeneratorState {
    last_timestamp: i64,
    last_random: [u8; RANDOM_LEN],
}

/// 单调递增的 push id 生成器
#[derive(Default)]
pub struct PushIdGenerator {
    state: Mutex<GeneratorState>,
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        self.next_id_at(now_millis())
    }

    /// 让之后生成的 id 都排在 `id` 之后（用于从已有数据恢复）
    ///
    /// `id` 不是合法 push id 时返回 false，状态不变。
    pub fn advance_past(&self, id: &str) -> bool {
        let Some((timestamp, random)) = Self::decode(id) else {
            return false;
        };
        let mut state = self.state.lock();
        if (timestamp, random) > (state.last_timestamp, state.last_random) {
            state.last_timestamp = timestamp;
            state.last_random = random;
        }
        true
    }

    pub(crate) fn next_id_at(&self, timestamp_ms: i64) -> MessageId {
        let mut state = self.state.lock();

        // 时钟回拨时沿用上一次的时间戳，保证单调
        let timestamp = timestamp_ms.max(state.last_timestamp);
        if timestamp == state.last_timestamp && state.last_timestamp != 0 {
            Self::increment(&mut state.last_random);
        } else {
            let mut rng = rand::thread_rng();
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }
        state.last_timestamp = timestamp;

        let mut id = String::with_capacity(TIME_LEN + RANDOM_LEN);
        let mut time_chars = [0u8; TIME_LEN];
        let mut now = timestamp.max(0) as u64;
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(now % 64) as usize];
            now /= 64;
        }
        id.extend(time_chars.iter().map(|&c| c as char));
        id.extend(state.last_random.iter().map(|&i| PUSH_CHARS[i as usize] as char));

        MessageId::new(id)
    }

    fn decode(id: &str) -> Option<(i64, [u8; RANDOM_LEN])> {
        let bytes = id.as_bytes();
        if bytes.len() != TIME_LEN + RANDOM_LEN {
            return None;
        }
        let index = |b: u8| PUSH_CHARS.iter().position(|&c| c == b).map(|i| i as u8);

        let mut timestamp: i64 = 0;
        for &b in &bytes[..TIME_LEN] {
            timestamp = timestamp * 64 + i64::from(index(b)?);
        }
        let mut random = [0u8; RANDOM_LEN];
        for (slot, &b) in random.iter_mut().zip(&bytes[TIME_LEN..]) {
            *slot = index(b)?;
        }
        Some((timestamp, random))
    }

    fn increment(random: &mut [u8; RANDOM_LEN]) {
        for slot in random.iter_mut().rev() {
            if *slot < 63 {
                *slot += 1;
                return;
            }
            *slot = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_well_formed() {
        let generator = PushIdGenerator::new();
        let ids: Vec<MessageId> = (0..1000).map(|_| generator.next_id()).collect();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        for id in &ids {
            assert_eq!(id.as_str().len(), TIME_LEN + RANDOM_LEN);
            assert!(id.as_str().bytes().all(|b| PUSH_CHARS.contains(&b)));
        }
    }

    #[test]
    fn test_same_millisecond_and_clock_skew() {
        let generator = PushIdGenerator::new();
        let a = generator.next_id_at(1_700_000_000_000);
        let b = generator.next_id_at(1_700_000_000_000);
        let c = generator.next_id_at(1_699_999_999_000);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(&a.as_str()[..TIME_LEN], &c.as_str()[..TIME_LEN]);
    }

    #[test]
    fn test_advance_past_future_id() {
        let ahead = PushIdGenerator::new().next_id_at(now_millis() + 3_600_000);

        let generator = PushIdGenerator::new();
        assert!(generator.advance_past(ahead.as_str()));
        let next = generator.next_id();
        assert!(next > ahead, "{} !> {}", next, ahead);
        assert_eq!(&next.as_str()[..TIME_LEN], &ahead.as_str()[..TIME_LEN]);

        // 较旧的 id 不会让生成器倒退
        let older = PushIdGenerator::new().next_id_at(1_000);
        assert!(generator.advance_past(older.as_str()));
        assert!(generator.next_id() > next);
    }

    #[test]
    fn test_advance_past_rejects_malformed() {
        let generator = PushIdGenerator::new();
        assert!(!generator.advance_past("short"));
        assert!(!generator.advance_past("-----------------!!!"));
        let id = generator.next_id_at(1_700_000_000_000);
        assert_eq!(PushIdGenerator::decode(id.as_str()).map(|(ts, _)| ts), Some(1_700_000_000_000));
    }

    #[test]
    fn test_later_timestamp_sorts_after() {
        let generator = PushIdGenerator::new();
        let a = generator.next_id_at(1_000);
        let b = generator.next_id_at(1_001);
        assert!(a < b);
    }
}
