use std::path::Path;

use crate::error::{Error, Result};

/// Target waveform: at least two finite points with strictly increasing x.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetCurve {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl TargetCurve {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self> {
        if points.len() < 2 {
            return Err(Error::CurveData(format!(
                "target curve needs at least 2 points, got {}",
                points.len()
            )));
        }
        if let Some((x, y)) = points.iter().find(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(Error::CurveData(format!("non-finite point ({}, {})", x, y)));
        }
        if let Some(w) = points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(Error::CurveData(format!(
                "x values must be strictly increasing: {} follows {}",
                w[1].0, w[0].0
            )));
        }

        let (xs, ys) = points.into_iter().unzip();
        Ok(Self { xs, ys })
    }

    /// Constant `value` across `[start, stop]`.
    pub fn horizontal_line(value: f64, start: f64, stop: f64) -> Result<Self> {
        Self::new(vec![(start, value), (stop, value)])
    }

    /// Load two named columns from a CSV file with a header row.
    ///
    /// Rows whose selected cells are not numeric are skipped.
    pub fn from_csv(path: impl AsRef<Path>, x_column: &str, y_column: &str) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());

        let header: Vec<&str> = lines
            .next()
            .ok_or_else(|| Error::CurveData(format!("{} is empty", path.display())))?
            .split(',')
            .map(str::trim)
            .collect();
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name.trim()))
                .ok_or_else(|| {
                    Error::CurveData(format!("column '{}' not found in {}", name, path.display()))
                })
        };
        let (xi, yi) = (find(x_column)?, find(y_column)?);

        let points = lines
            .filter_map(|line| {
                let cells: Vec<&str> = line.split(',').map(str::trim).collect();
                let x = cells.get(xi)?.parse::<f64>().ok()?;
                let y = cells.get(yi)?.parse::<f64>().ok()?;
                Some((x, y))
            })
            .collect();
        Self::new(points)
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn x_range(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }

    /// Resample onto `grid`.
    pub fn sample(&self, grid: &[f64]) -> Vec<f64> {
        resample(&self.xs, &self.ys, grid)
    }
}

/// Piecewise-linear interpolation, holding the end values outside `xs`.
///
/// `xs` must be sorted ascending and the same length as `ys`.
pub fn interpolate(xs: &[f64], ys: &[f64], at: f64) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 || at.is_nan() {
        return f64::NAN;
    }
    if n == 1 {
        return ys[0];
    }
    if at <= xs[0] {
        return ys[0];
    }
    if at >= xs[n - 1] {
        return ys[n - 1];
    }

    // Clamped so stray NaNs in `xs` cannot push the search off either end
    let hi = xs[..n].partition_point(|&x| x <= at).clamp(1, n - 1);
    let lo = hi - 1;
    let span = xs[hi] - xs[lo];
    if span <= 0.0 {
        return ys[hi];
    }
    let t = (at - xs[lo]) / span;
    ys[lo] + t * (ys[hi] - ys[lo])
}

pub fn resample(xs: &[f64], ys: &[f64], grid: &[f64]) -> Vec<f64> {
    grid.iter().map(|&x| interpolate(xs, ys, x)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_validation() {
        assert!(matches!(TargetCurve::new(vec![(0.0, 1.0)]), Err(Error::CurveData(_))));
        assert!(matches!(
            TargetCurve::new(vec![(0.0, 1.0), (0.0, 2.0)]),
            Err(Error::CurveData(_))
        ));
        assert!(matches!(
            TargetCurve::new(vec![(1.0, 1.0), (0.5, 2.0)]),
            Err(Error::CurveData(_))
        ));
        assert!(matches!(
            TargetCurve::new(vec![(0.0, f64::NAN), (1.0, 2.0)]),
            Err(Error::CurveData(_))
        ));
        let line = TargetCurve::horizontal_line(4.0, 0.0, 1e-3).unwrap();
        assert_eq!(line.x_range(), (0.0, 1e-3));
        assert_eq!(line.ys(), &[4.0, 4.0]);
    }

    #[test]
    fn test_interpolate() {
        let xs = [0.0, 1.0, 3.0];
        let ys = [0.0, 10.0, 30.0];
        assert_relative_eq!(interpolate(&xs, &ys, 0.5), 5.0);
        assert_relative_eq!(interpolate(&xs, &ys, 2.0), 20.0);
        assert_eq!(interpolate(&xs, &ys, 1.0), 10.0);
        // Held at the ends
        assert_eq!(interpolate(&xs, &ys, -1.0), 0.0);
        assert_eq!(interpolate(&xs, &ys, 9.0), 30.0);
        // Repeated x from simulator breakpoints
        assert_eq!(interpolate(&[0.0, 1.0, 1.0, 2.0], &[0.0, 1.0, 5.0, 5.0], 1.5), 5.0);
    }

    #[test]
    fn test_interpolate_non_finite_input() {
        let xs = [0.0, 1.0, 3.0];
        let ys = [0.0, 10.0, 30.0];
        assert!(interpolate(&xs, &ys, f64::NAN).is_nan());
        assert_eq!(resample(&xs, &ys, &[f64::NAN, 1.0])[1], 10.0);

        // A NaN time cell in the samples must not panic
        assert!(interpolate(&[f64::NAN, 1.0, 2.0], &[1.0, 2.0, 3.0], 0.5).is_nan());
        assert_eq!(interpolate(&[0.0, 1.0, f64::NAN], &[1.0, 2.0, 3.0], 0.5), 1.5);
        assert_eq!(interpolate(&[2.0], &[7.0], 5.0), 7.0);
    }

    #[test]
    fn test_constant_curves_align_to_zero() {
        let target = TargetCurve::new(vec![(0.0, 4.0), (1.0, 4.0)]).unwrap();
        let sim_x = [0.0, 0.13, 0.4, 0.77, 1.2];
        let sim_y = [4.0; 5];
        let grid = [0.0, 0.25, 0.5, 0.9, 1.0];
        let residual: Vec<f64> = target
            .sample(&grid)
            .iter()
            .zip(resample(&sim_x, &sim_y, &grid))
            .map(|(ideal, sim)| ideal - sim)
            .collect();
        assert!(residual.iter().all(|&r| r == 0.0));
    }

    #[test]
    fn test_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.csv");
        std::fs::write(&path, "time, vout, other\n0, 1.0, x\n0.5, 2.0, x\nbad,row,x\n1.0, 3.0, x\n").unwrap();

        let curve = TargetCurve::from_csv(&path, "TIME", "Vout").unwrap();
        assert_eq!(curve.xs(), &[0.0, 0.5, 1.0]);
        assert_eq!(curve.ys(), &[1.0, 2.0, 3.0]);
        assert!(matches!(
            TargetCurve::from_csv(&path, "time", "missing"),
            Err(Error::CurveData(_))
        ));
    }
}
