//! The adaptive poll schedule.
//!
//! Fresh numbers poll hot (a user is staring at the screen waiting for a
//! code); stale ones back off. Any SMS re-heats the schedule briefly for
//! the common multi-part / retry case.

use std::time::Duration;

/// Inputs the schedule decides on.
#[derive(Clone, Copy, Debug)]
pub struct PollContext {
    /// Time since the number was created.
    pub age: Duration,
    /// Time since the first SMS arrived, if any has.
    pub since_first_sms: Option<Duration>,
    /// This attempt errored.
    pub errored: bool,
}

const HOT_WINDOW: Duration = Duration::from_secs(2 * 60);
const WARM_WINDOW: Duration = Duration::from_secs(10 * 60);
const SMS_HOT_WINDOW: Duration = Duration::from_secs(60);

pub const HOT_INTERVAL: Duration = Duration::from_secs(3);
pub const WARM_INTERVAL: Duration = Duration::from_secs(10);
pub const COLD_INTERVAL: Duration = Duration::from_secs(30);
pub const SMS_HOT_INTERVAL: Duration = Duration::from_secs(5);
pub const SMS_COLD_INTERVAL: Duration = Duration::from_secs(20);
pub const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Next delay before polling this number again.
pub fn next_poll_delay(ctx: PollContext) -> Duration {
    if ctx.errored {
        return ERROR_BACKOFF;
    }
    if let Some(since_sms) = ctx.since_first_sms {
        return if since_sms <= SMS_HOT_WINDOW {
            SMS_HOT_INTERVAL
        } else {
            SMS_COLD_INTERVAL
        };
    }
    if ctx.age <= HOT_WINDOW {
        HOT_INTERVAL
    } else if ctx.age <= WARM_WINDOW {
        WARM_INTERVAL
    } else {
        COLD_INTERVAL
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(age_secs: u64) -> PollContext {
        PollContext {
            age: Duration::from_secs(age_secs),
            since_first_sms: None,
            errored: false,
        }
    }

    #[test]
    fn age_tiers() {
        assert_eq!(next_poll_delay(ctx(10)), HOT_INTERVAL);
        assert_eq!(next_poll_delay(ctx(119)), HOT_INTERVAL);
        assert_eq!(next_poll_delay(ctx(121)), WARM_INTERVAL);
        assert_eq!(next_poll_delay(ctx(599)), WARM_INTERVAL);
        assert_eq!(next_poll_delay(ctx(601)), COLD_INTERVAL);
    }

    #[test]
    fn sms_overrides_age() {
        let mut ctx = ctx(700);
        ctx.since_first_sms = Some(Duration::from_secs(10));
        assert_eq!(next_poll_delay(ctx), SMS_HOT_INTERVAL);

        ctx.since_first_sms = Some(Duration::from_secs(90));
        assert_eq!(next_poll_delay(ctx), SMS_COLD_INTERVAL);
    }

    #[test]
    fn error_overrides_everything() {
        let mut ctx = ctx(10);
        ctx.errored = true;
        ctx.since_first_sms = Some(Duration::from_secs(1));
        assert_eq!(next_poll_delay(ctx), ERROR_BACKOFF);
    }
}
