use chrono::{Duration, NaiveDate};

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Parse a `dd/mm/yyyy` date as used by the portal query language.
pub fn parse_ddmmyyyy(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y").ok()
}

/// Format a date as `dd/mm/yyyy` for the portal query language.
pub fn format_ddmmyyyy(d: NaiveDate) -> String {
    d.format("%d/%m/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2025, 1),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()
        );
        assert_eq!(
            last_day_of_month(2025, 2),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        ); // Leap year
        assert_eq!(
            last_day_of_month(2025, 12),
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_parse_ddmmyyyy() {
        assert_eq!(
            parse_ddmmyyyy("31/01/2024"),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert_eq!(
            parse_ddmmyyyy(" 01/02/2024 "),
            NaiveDate::from_ymd_opt(2024, 2, 1)
        );
        assert_eq!(parse_ddmmyyyy("2024-01-31"), None);
        assert_eq!(parse_ddmmyyyy("31/13/2024"), None);
    }

    #[test]
    fn test_format_ddmmyyyy() {
        assert_eq!(
            format_ddmmyyyy(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()),
            "05/01/2024"
        );
    }
}
