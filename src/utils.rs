use std::path::Path;

use tch::{Device, Kind, Tensor};

pub(crate) fn read_file<P: AsRef<Path>>(path: P) -> anyhow::Result<String> {
    std::fs::read_to_string(path.as_ref()).map_err(|e| {
        let context = format!("error reading {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Number of NaN or infinite entries in `xs`.
pub fn count_non_finite(xs: &Tensor) -> i64 {
    xs.isfinite().logical_not().to_kind(Kind::Int64).sum(Kind::Int64).int64_value(&[])
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().int64_value(&[]) != 0
}

pub fn all_finite(xs: &Tensor) -> bool {
    count_non_finite(xs) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_counts() {
        let xs = Tensor::from_slice(&[1.0f64, f64::NAN, f64::INFINITY, -2.0]);
        assert_eq!(count_non_finite(&xs), 2);
        assert!(has_nan(&xs));
        assert!(!all_finite(&xs));
        let ys = Tensor::from_slice(&[0.0f64, 3.5]);
        assert!(!has_nan(&ys));
        assert!(all_finite(&ys));
    }

    #[test]
    fn test_read_file_reports_path() {
        let err = read_file("does/not/exist.toml").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.toml"));
    }
}
