//! Dial digit buffer and inter-digit timer of one port

use tokio::task::JoinHandle;

/// Pending inter-digit timeout.
struct DialTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Digits dialed so far on a port.
///
/// Holds at most `max_extension_length - 1` digits. At most one timer is
/// pending at any time; arming a new one aborts the previous one, and a timer
/// that fires after being replaced or cancelled is recognized as stale by
/// its generation.
pub struct DigitCollector {
    buffer: String,
    max_digits: usize,
    timer: Option<DialTimer>,
    generation: u64,
}

impl DigitCollector {
    pub fn new(max_extension_length: usize) -> Self {
        let max_digits = max_extension_length.saturating_sub(1).max(1);
        Self {
            buffer: String::with_capacity(max_digits),
            max_digits,
            timer: None,
            generation: 0,
        }
    }

    /// Append a digit; false when the buffer is already full.
    pub fn push(&mut self, digit: char) -> bool {
        if self.buffer.len() >= self.max_digits {
            return false;
        }
        self.buffer.push(digit);
        true
    }

    /// Take the dialed digits, leaving the buffer empty.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_digits(&self) -> usize {
        self.max_digits
    }

    /// Reserve the generation for a timer about to be armed.
    pub fn next_generation(&mut self) -> u64 {
        self.cancel_timer();
        self.generation
    }

    /// Install the timer spawned for `generation`, replacing any pending one.
    pub fn arm(&mut self, generation: u64, handle: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(DialTimer { generation, handle }) {
            old.handle.abort();
        }
    }

    pub fn cancel_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Consume the pending timer if it is the one for `generation`.
    pub fn fire(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation && self.generation == generation => {
                self.timer = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for DigitCollector {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_is_one_less_than_extension_length() {
        let mut digits = DigitCollector::new(5);
        assert_eq!(digits.max_digits(), 4);
        for d in ['1', '2', '3', '4'] {
            assert!(digits.push(d));
        }
        assert!(!digits.push('5'));
        assert_eq!(digits.as_str(), "1234");

        assert_eq!(digits.take(), "1234");
        assert!(digits.is_empty());
    }

    #[tokio::test]
    async fn test_rearm_aborts_previous_timer() {
        let mut digits = DigitCollector::new(80);

        let first = digits.next_generation();
        digits.arm(first, tokio::spawn(tokio::time::sleep(Duration::from_secs(60))));

        let second = digits.next_generation();
        assert_ne!(first, second);
        digits.arm(second, tokio::spawn(tokio::time::sleep(Duration::from_secs(60))));

        assert!(!digits.fire(first));
        assert!(digits.fire(second));
        assert!(!digits.has_timer());
    }

    #[tokio::test]
    async fn test_cancel_makes_timer_stale() {
        let mut digits = DigitCollector::new(80);
        let generation = digits.next_generation();
        digits.arm(generation, tokio::spawn(async {}));

        digits.cancel_timer();
        assert!(!digits.has_timer());
        assert!(!digits.fire(generation));
    }
}
