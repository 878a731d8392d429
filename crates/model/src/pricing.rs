/// Price of a slot lasting `duration_minutes` at `price_per_hour`.
///
/// Minutes are prorated and the result rounds half up to the nearest whole currency
/// unit. Non-positive inputs price at zero; overflow saturates.
pub fn calculate_total_price(price_per_hour: i64, duration_minutes: i64) -> i64 {
    if price_per_hour <= 0 || duration_minutes <= 0 {
        return 0;
    }
    match price_per_hour.checked_mul(duration_minutes) {
        Some(total) => total / 60 + i64::from(total % 60 >= 30),
        None => i64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::calculate_total_price;

    #[test]
    fn test_zero_for_non_positive_inputs() {
        assert_eq!(calculate_total_price(0, 60), 0);
        assert_eq!(calculate_total_price(-100, 60), 0);
        assert_eq!(calculate_total_price(100_000, 0), 0);
        assert_eq!(calculate_total_price(100_000, -60), 0);
    }

    #[test]
    fn test_linear_in_whole_hours() {
        let hourly = 150_000;
        for hours in 1..=8 {
            assert_eq!(calculate_total_price(hourly, hours * 60), hourly * hours);
        }
    }

    #[test]
    fn test_prorates_minutes() {
        assert_eq!(calculate_total_price(100_000, 90), 150_000);
        assert_eq!(calculate_total_price(100_000, 30), 50_000);
        // 7 * 10 / 60 = 1.1666 -> 1, 7 * 50 / 60 = 5.8333 -> 6
        assert_eq!(calculate_total_price(7, 10), 1);
        assert_eq!(calculate_total_price(7, 50), 6);
        // exactly half rounds up: 1 * 30 / 60 = 0.5
        assert_eq!(calculate_total_price(1, 30), 1);
    }

    #[test]
    fn test_saturates_on_overflow() {
        assert_eq!(calculate_total_price(i64::MAX, 120), i64::MAX);
    }
}
