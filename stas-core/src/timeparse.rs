//! Permissive human-readable duration parser, supporting both word durations
//! ("1 minute, 24 secs") and clock-style durations ("1:24", ":22").

use once_cell::sync::Lazy;
use regex::Regex;

static SIGN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?P<sign>[+-])?\s*(?P<rest>.*)$").unwrap());

static CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:(?P<hours>\d+):)?(?P<minutes>\d+):)?(?P<seconds>\d+(?:\.\d+)?)$").unwrap()
});

/// Leading-colon seconds-only form (e.g. `":22"`), matching the original's
/// `SECCLOCK = r':(?P<secs>\d{2}(?:\.\d+)?)'`.
static SECCLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:(?P<seconds>\d+(?:\.\d+)?)$").unwrap());

static WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        (?P<value>\d+(?:\.\d+)?)\s*
        (?P<unit>
            d(?:ays?)? |
            h(?:ours?|rs?)? |
            m(?:in(?:ute)?s?)? |
            s(?:ec(?:ond)?s?)?
        )",
    )
    .unwrap()
});

/// Parse a duration string into seconds. Returns `None` when the string
/// cannot be parsed, matching the original's `None`-on-failure contract
/// rather than raising.
pub fn timeparse(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let caps = SIGN.captures(trimmed)?;
    let negative = caps.name("sign").map(|m| m.as_str() == "-").unwrap_or(false);
    let rest = caps.name("rest").unwrap().as_str().trim();
    if rest.is_empty() {
        return None;
    }

    let magnitude = if let Some(c) = SECCLOCK.captures(rest) {
        c.name("seconds").unwrap().as_str().parse().ok()?
    } else if let Some(c) = CLOCK.captures(rest) {
        let hours: f64 = c
            .name("hours")
            .map(|m| m.as_str().parse().unwrap_or(0.0))
            .unwrap_or(0.0);
        let minutes: f64 = c
            .name("minutes")
            .map(|m| m.as_str().parse().unwrap_or(0.0))
            .unwrap_or(0.0);
        let seconds: f64 = c.name("seconds").unwrap().as_str().parse().ok()?;
        hours * 3600.0 + minutes * 60.0 + seconds
    } else {
        let mut total = 0.0_f64;
        let mut matched_any = false;
        for m in WORDS.captures_iter(rest) {
            matched_any = true;
            let value: f64 = m.name("value").unwrap().as_str().parse().ok()?;
            let unit = m.name("unit").unwrap().as_str().to_ascii_lowercase();
            let scale = match unit.chars().next().unwrap() {
                'd' => 86400.0,
                'h' => 3600.0,
                'm' => 60.0,
                's' => 1.0,
                _ => return None,
            };
            total += value * scale;
        }
        if !matched_any {
            return None;
        }
        total
    };

    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn clock_minute_seconds() {
        approx(timeparse("1:24").unwrap(), 84.0);
    }

    #[test]
    fn clock_seconds_only() {
        approx(timeparse(":22").unwrap(), 22.0);
    }

    #[test]
    fn words_minute_and_seconds() {
        approx(timeparse("1 minute, 24 secs").unwrap(), 84.0);
    }

    #[test]
    fn fractional_minutes() {
        approx(timeparse("1.2 minutes").unwrap(), 72.0);
    }

    #[test]
    fn fractional_seconds() {
        approx(timeparse("1.2 seconds").unwrap(), 1.2);
    }

    #[test]
    fn negative_sign() {
        approx(timeparse("- 1 minute").unwrap(), -60.0);
    }

    #[test]
    fn garbage_returns_none() {
        assert_eq!(timeparse("blah"), None);
    }

    #[test]
    fn empty_returns_none() {
        assert_eq!(timeparse(""), None);
        assert_eq!(timeparse("   "), None);
    }
}
