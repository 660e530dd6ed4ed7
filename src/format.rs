/// Format a playback time as `MM:SS`. Negative times show as `00:00`.
pub fn format_time(millis: i64) -> String {
    if millis < 0 {
        return "00:00".to_string();
    }
    let total_secs = millis / 1000;
    format!("{:02}:{:02}", total_secs / 60, total_secs % 60)
}

/// Format an equalizer center frequency given in milli-hertz
pub fn format_frequency(milli_hertz: u32) -> String {
    let hertz = milli_hertz / 1000;
    if hertz >= 1000 {
        format!("{}k", hertz / 1000)
    } else {
        hertz.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times() {
        assert_eq!(format_time(-1), "00:00");
        assert_eq!(format_time(0), "00:00");
        assert_eq!(format_time(59_999), "00:59");
        assert_eq!(format_time(61_000), "01:01");
        assert_eq!(format_time(3_723_000), "62:03");
    }

    #[test]
    fn frequencies() {
        assert_eq!(format_frequency(60_000), "60");
        assert_eq!(format_frequency(910_000), "910");
        assert_eq!(format_frequency(3_600_000), "3k");
        assert_eq!(format_frequency(14_000_000), "14k");
    }
}
