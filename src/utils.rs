use crate::errors::FairVaeError;
use std::fs;
use std::path::Path;

/// Create a string of all available items.
pub fn items_to_strings(items: Vec<&str>) -> String {
    let mut s = String::new();
    for i in items {
        s.push_str(i);
        s.push_str(&String::from(", "));
    }
    s
}

// Validation
pub fn validate_positive_float_parameter(value: f64, parameter: &str) -> Result<(), FairVaeError> {
    validate_float_parameter(value, f64::MIN_POSITIVE, f64::INFINITY, parameter)
}

pub fn validate_float_parameter(value: f64, min: f64, max: f64, parameter: &str) -> Result<(), FairVaeError> {
    if value.is_nan() || value < min || max < value {
        let ex_msg = format!("real value within range {} and {}", min, max);
        Err(FairVaeError::InvalidParameter(
            parameter.to_string(),
            ex_msg,
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_positive_usize_parameter(value: usize, parameter: &str) -> Result<(), FairVaeError> {
    if value == 0 {
        Err(FairVaeError::InvalidParameter(
            parameter.to_string(),
            "a positive integer".to_string(),
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Create every directory on the way to `path`.
pub fn build_path<P: AsRef<Path>>(path: P) -> Result<(), FairVaeError> {
    fs::create_dir_all(path.as_ref())
        .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", path.as_ref().display(), e)))
}

/// Encode a binary label row as its bit string, e.g. `[1., 0., 1.]` -> `"101"`.
pub fn label_key(row: &[f32]) -> String {
    row.iter().map(|v| if *v > 0.5 { '1' } else { '0' }).collect()
}

/// Lexicographic ordering of float rows, used wherever rows must be deduplicated.
pub fn cmp_rows(a: &[f32], b: &[f32]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.total_cmp(y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

pub fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

/// Median matching numpy, the average of the two middle values for even lengths.
pub fn median(v: &[f64]) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    let mut sorted = v.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn precision_round(n: f64, precision: i32) -> f64 {
    let p = (10.0_f64).powi(precision);
    (n * p).round() / p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_float_parameter() {
        assert!(validate_float_parameter(0.5, 0.0, 1.0, "ratio").is_ok());
        assert!(validate_float_parameter(1.5, 0.0, 1.0, "ratio").is_err());
        assert!(validate_float_parameter(f64::NAN, 0.0, 1.0, "ratio").is_err());
        assert!(validate_positive_float_parameter(0.0, "lr").is_err());
    }

    #[test]
    fn test_label_key() {
        assert_eq!(label_key(&[1., 0., 1.]), "101");
        assert_eq!(label_key(&[]), "");
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3., 1., 2.]), 2.);
        assert_eq!(median(&[4., 1., 2., 3.]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_cmp_rows() {
        use std::cmp::Ordering;
        assert_eq!(cmp_rows(&[0., 1.], &[1., 0.]), Ordering::Less);
        assert_eq!(cmp_rows(&[1., 0.], &[1., 0.]), Ordering::Equal);
    }
}
