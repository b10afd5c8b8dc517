use chrono::Utc;
use ethers::types::U256;

/// Token decimals of XEN and XBURN.
pub const TOKEN_DECIMALS: u32 = 18;

/// Format a raw token amount with at most `precision` fractional digits,
/// trailing zeros removed.
pub fn format_token_amount(amount: U256, decimals: u32, precision: usize) -> String {
    let full = ethers::utils::format_units(amount, decimals).unwrap_or_else(|_| "0.0".to_string());
    let (whole, fraction) = full.split_once('.').unwrap_or((full.as_str(), ""));
    let fraction: String = fraction.chars().take(precision).collect();
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, fraction)
    }
}

/// 18-decimal token amount with four fractional digits.
pub fn format_token(amount: U256) -> String {
    format_token_amount(amount, TOKEN_DECIMALS, 4)
}

/// Lossy conversion for ratios and display.
pub fn to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

pub fn format_usd(value: f64) -> String {
    if value >= 1.0 {
        format!("${:.2}", value)
    } else {
        format!("${:.8}", value)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}
