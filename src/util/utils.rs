pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Parses `<id>=<product>:<amount>`, the station selection syntax of the command line.
pub fn parse_selection(text: &str) -> Option<(u32, String, f64)> {
    let (station, rest) = text.split_once('=')?;
    let (product, amount) = rest.rsplit_once(':')?;
    let product = product.trim();
    if product.is_empty() {
        return None;
    }
    Some((
        station.trim().parse().ok()?,
        product.to_string(),
        amount.trim().parse().ok()?,
    ))
}

#[test]
fn test_round_to() {
    assert_eq!(round_to(1.23456, 3), 1.235);
    assert_eq!(round_to(102.49, 1), 102.5);
    assert_eq!(round_to(-0.04, 1), -0.0);
    assert_eq!(round_to(7.0, 0), 7.0);
}

#[test]
fn test_parse_selection() {
    assert_eq!(
        parse_selection("2=Primer:150.5"),
        Some((2, "Primer".to_string(), 150.5))
    );
    assert_eq!(
        parse_selection("1=Base: Gloss:20"),
        Some((1, "Base: Gloss".to_string(), 20.0))
    );
    assert_eq!(parse_selection("Primer:10"), None);
    assert_eq!(parse_selection("x=Primer:10"), None);
    assert_eq!(parse_selection("3=:10"), None);
}
