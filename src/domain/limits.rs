//! Request throttling for the public booking form and the AI-heavy admin
//! actions.

use std::num::NonZeroU32;

use anyhow::{Result, bail};
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use tracing::warn;

/// Bookings per minute accepted from the public form, shop-wide.
pub const PUBLIC_BOOKING_PER_MINUTE: u32 = 10;
/// Campaign drafts per minute, per user.
pub const HEAVY_AI_PER_MINUTE: u32 = 3;

pub struct RateLimits {
    public_booking: DefaultDirectRateLimiter,
    heavy_ai: DefaultKeyedRateLimiter<String>,
}

impl RateLimits {
    pub fn new(public_booking: Quota, heavy_ai: Quota) -> Self {
        Self {
            public_booking: RateLimiter::direct(public_booking),
            heavy_ai: RateLimiter::keyed(heavy_ai),
        }
    }

    /// Shop-wide limit on online bookings.
    pub fn check_public_booking(&self) -> Result<()> {
        if self.public_booking.check().is_err() {
            warn!(limit = "publicBooking", "Rate limit exceeded");
            bail!("Rate limit exceeded: too many bookings, please try again shortly");
        }
        Ok(())
    }

    /// Per-user limit on generative-AI requests.
    pub fn check_heavy_ai(&self, user_id: &str) -> Result<()> {
        if self.heavy_ai.check_key(&user_id.to_string()).is_err() {
            warn!(limit = "heavyAI", user_id = %user_id, "Rate limit exceeded");
            bail!("Rate limit exceeded: too many AI requests, please try again shortly");
        }
        Ok(())
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new(
            per_minute(PUBLIC_BOOKING_PER_MINUTE),
            per_minute(HEAVY_AI_PER_MINUTE),
        )
    }
}

/// Quota of `n` requests per minute; zero is treated as one.
pub fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}
