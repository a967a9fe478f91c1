use std::cmp::min;
use std::time::Duration;
use crate::config::RmpConfig;

/// The retransmit interval of an outbound transfer. It grows by a configured factor with every
///  timeout and is capped at a maximum. It never shrinks for the lifetime of a transfer, so a
///  congested path does not get hammered again after a single lucky ACK.
#[derive(Debug, Clone)]
pub struct RetransmitBackoff {
    interval: Duration,
    config_max_interval: Duration,
    config_factor_eighths: u32,
}

impl RetransmitBackoff {
    pub fn new(config: &RmpConfig) -> Self {
        let result = RetransmitBackoff {
            interval: config.initial_retransmit_timeout,
            config_max_interval: config.max_retransmit_timeout,
            config_factor_eighths: config.retransmit_backoff_factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    pub fn current(&self) -> Duration {
        self.interval
    }

    /// called on a retransmit timeout, returns the new interval
    pub fn back_off(&mut self) -> Duration {
        let grown = self.interval.checked_mul(self.config_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max_interval);
        self.interval = min(grown, self.config_max_interval);
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::double(500, 8000, 16, 1000)]
    #[case::double_capped(5000, 8000, 16, 8000)]
    #[case::at_max(8000, 8000, 16, 8000)]
    #[case::factor_1_5(500, 8000, 12, 750)]
    #[case::factor_1_5_capped(6000, 8000, 12, 8000)]
    #[case::constant(500, 8000, 8, 500)]
    fn test_back_off(
        #[case] interval_millis: u64,
        #[case] max_millis: u64,
        #[case] factor_eighths: u32,
        #[case] expected_millis: u64,
    ) {
        let mut backoff = RetransmitBackoff {
            interval: Duration::from_millis(interval_millis),
            config_max_interval: Duration::from_millis(max_millis),
            config_factor_eighths: factor_eighths,
        };

        assert_eq!(backoff.back_off(), Duration::from_millis(expected_millis));
        assert_eq!(backoff.current(), Duration::from_millis(expected_millis));
    }

    #[test]
    fn test_back_off_huge_interval() {
        let mut backoff = RetransmitBackoff {
            interval: Duration::MAX / 2,
            config_max_interval: Duration::MAX,
            config_factor_eighths: 32,
        };
        assert_eq!(backoff.back_off(), Duration::MAX);
        assert_eq!(backoff.back_off(), Duration::MAX);
    }

    #[test]
    fn test_sequence_from_config() {
        let mut backoff = RetransmitBackoff::new(&RmpConfig::default());
        assert_eq!(backoff.current(), Duration::from_millis(500));

        let intervals = (0..6)
            .map(|_| backoff.back_off().as_millis())
            .collect::<Vec<_>>();
        assert_eq!(intervals, vec![1000, 2000, 4000, 8000, 8000, 8000]);
    }
}
