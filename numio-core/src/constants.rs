use std::time::Duration;

// --- External call deadlines --- //

/// Default deadline for any external call.
pub const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for provider `get_status` calls made by the poller.
pub const PROVIDER_STATUS_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for webhook deliveries to subscribers.
pub const WEBHOOK_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

// --- Inbox poller --- //

/// Max numbers picked up per poll tick.
pub const POLL_BATCH_SIZE: usize = 50;
/// Bounded concurrency for per-number poll tasks.
pub const POLL_CONCURRENCY: usize = 8;
/// TTL on the per-number distributed poll lock.
pub const POLL_LOCK_TTL: Duration = Duration::from_secs(60);
/// Numbers expiring within this horizon are not worth polling.
pub const POLL_EXPIRY_SLACK: Duration = Duration::from_secs(30);
/// Consecutive errors after which a number is surfaced as stalled.
pub const POLL_MAX_ERRORS: u32 = 5;
/// Poll backoff applied after an error.
pub const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(30);
/// Per-number rate limit: polls per minute.
pub const POLL_RATE_PER_MIN: u32 = 30;
/// In-flight poll tasks get this long to finish on shutdown.
pub const POLL_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// SMS content dedup window per number.
pub const SMS_DEDUP_WINDOW: Duration = Duration::from_secs(10);
/// Max accepted SMS content length; longer content is truncated.
pub const SMS_MAX_CONTENT_LEN: usize = 1024;

// --- Activations --- //

/// How long a purchased number stays usable before expiry.
pub const ACTIVATION_TTL: Duration = Duration::from_secs(15 * 60);
/// Delay before the first poll of a fresh number.
pub const FIRST_POLL_DELAY: Duration = Duration::from_secs(3);
/// RESERVED activations older than this get a provider-request retry.
pub const STALE_RESERVED_AGE: Duration = Duration::from_secs(60);

// --- Catalogue sync --- //

/// Provider metadata is reused for this long before a refetch.
pub const METADATA_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Price list cache TTL.
pub const PRICE_CACHE_TTL: Duration = Duration::from_secs(60);
/// Per-provider price sync request budget per minute.
pub const SYNC_RATE_PER_MIN: u32 = 180;
/// Per-provider price sync concurrency cap.
pub const SYNC_CONCURRENCY: usize = 50;
/// Offer insert chunk size.
pub const OFFER_CHUNK_SIZE: usize = 1000;
/// How long a PENDING offer reservation holds its stock.
pub const RESERVATION_TTL: Duration = Duration::from_secs(120);

// --- Outbox --- //

/// Outbox dispatch batch size.
pub const OUTBOX_BATCH_SIZE: usize = 100;
/// Attempts before an outbox event lands in the DLQ.
pub const OUTBOX_MAX_RETRIES: u32 = 5;
/// Processed outbox rows older than this are purged hourly.
pub const OUTBOX_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// --- Events --- //

/// Per-user replay streams are trimmed to roughly this many entries.
pub const USER_STREAM_MAXLEN: usize = 100;

// --- Idempotency --- //

/// Stored idempotent results expire after this long.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// --- Webhooks --- //

/// Allowed clock drift on inbound webhook timestamps.
pub const WEBHOOK_TOLERANCE: Duration = Duration::from_secs(300);
