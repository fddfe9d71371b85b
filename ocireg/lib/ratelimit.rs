//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Rate limit state parsed from `RateLimit-*` response headers.
///
/// Header values may carry policy suffixes (`100;w=21600`); only the leading
/// integer is significant to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimit {
    /// True when the response carried any rate limit header.
    pub set: bool,

    /// The request allowance in the current window.
    pub limit: Option<u64>,

    /// Requests remaining in the current window.
    pub remaining: Option<u64>,

    /// Seconds until the window resets.
    pub reset: Option<u64>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RateLimit {
    /// Builds rate limit state from a header lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let limit = lookup("ratelimit-limit").and_then(|v| parse_leading_u64(&v));
        let remaining = lookup("ratelimit-remaining").and_then(|v| parse_leading_u64(&v));
        let reset = lookup("ratelimit-reset").and_then(|v| parse_leading_u64(&v));
        Self {
            set: limit.is_some() || remaining.is_some() || reset.is_some(),
            limit,
            remaining,
            reset,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_leading_u64(value: &str) -> Option<u64> {
    value
        .split(|c: char| c == ';' || c == ',')
        .next()?
        .trim()
        .parse()
        .ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
