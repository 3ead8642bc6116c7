use ndarray::Array1;

/// Straight line `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least-squares line through `(x[i], y[i])`.
///
/// Returns `None` for fewer than two points, mismatched lengths or when all
/// `x` are equal.
pub fn linear_fit(x: &Array1<f64>, y: &Array1<f64>) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }

    let x_mean = x.mean()?;
    let y_mean = y.mean()?;
    let dx = x - x_mean;
    let dy = y - y_mean;

    let sxx = dx.dot(&dx);
    if sxx == 0.0 {
        return None;
    }
    let slope = dx.dot(&dy) / sxx;

    Some(LinearFit {
        slope,
        intercept: y_mean - slope * x_mean,
    })
}
