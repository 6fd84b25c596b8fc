use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{FerError, Result};

/// Multinomial Naive Bayes over pixel intensities treated as counts.
#[derive(Debug, Clone)]
pub struct MultinomialNb {
    pub alpha: f64,
    /// Class indices that had at least one training sample.
    pub classes: Vec<usize>,
    pub class_log_prior: Array1<f64>,
    /// `classes × features`.
    pub feature_log_prob: Array2<f64>,
}

impl MultinomialNb {
    pub fn fit(x: ArrayView2<'_, u8>, y: &[usize], alpha: f64) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(FerError::Empty("Naive Bayes needs training samples"));
        }
        if x.nrows() != y.len() {
            return Err(FerError::InvalidConfig(format!(
                "{} samples but {} labels",
                x.nrows(),
                y.len()
            )));
        }

        let mut classes: Vec<usize> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();

        let n_features = x.ncols();
        let mut feature_counts = Array2::<f64>::zeros((classes.len(), n_features));
        let mut class_counts = Array1::<f64>::zeros(classes.len());
        for (row, &label) in x.axis_iter(Axis(0)).zip(y) {
            let c = classes.binary_search(&label).unwrap_or_default();
            class_counts[c] += 1.0;
            feature_counts
                .row_mut(c)
                .zip_mut_with(&row, |acc, &v| *acc += f64::from(v));
        }

        let smoothed = feature_counts.mapv(|v| v + alpha);
        let totals = smoothed.sum_axis(Axis(1)).insert_axis(Axis(1));
        let feature_log_prob = (&smoothed / &totals).mapv(f64::ln);
        let class_log_prior = class_counts.mapv(|c| (c / y.len() as f64).ln());

        Ok(Self {
            alpha,
            classes,
            class_log_prior,
            feature_log_prob,
        })
    }

    /// Joint log-likelihood, `samples × classes`.
    pub fn joint_log_likelihood(&self, x: ArrayView2<'_, u8>) -> Array2<f64> {
        let xf = x.mapv(f64::from);
        xf.dot(&self.feature_log_prob.t()) + &self.class_log_prior
    }

    pub fn predict(&self, x: ArrayView2<'_, u8>) -> Vec<usize> {
        self.joint_log_likelihood(x)
            .axis_iter(Axis(0))
            .map(|row| self.classes[argmax(row.iter().copied())])
            .collect()
    }
}

pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn separates_count_profiles() {
        let x = array![
            [9u8, 1, 0],
            [8, 2, 0],
            [0, 1, 9],
            [1, 0, 8],
            [0, 9, 1],
            [1, 8, 0],
        ];
        let y = [0, 0, 4, 4, 2, 2];
        let nb = MultinomialNb::fit(x.view(), &y, 1.0).unwrap();
        assert_eq!(nb.classes, vec![0, 2, 4]);
        assert_eq!(nb.predict(x.view()), y.to_vec());

        let probe = array![[20u8, 0, 1], [0, 0, 30]];
        assert_eq!(nb.predict(probe.view()), vec![0, 4]);
    }

    #[test]
    fn feature_probabilities_are_normalized() {
        let x = array![[3u8, 1], [0, 4]];
        let nb = MultinomialNb::fit(x.view(), &[0, 1], 1.0).unwrap();
        for row in nb.feature_log_prob.axis_iter(Axis(0)) {
            let total: f64 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
        assert!((nb.class_log_prior[0] - 0.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn label_count_must_match() {
        let x = array![[1u8, 2]];
        assert!(MultinomialNb::fit(x.view(), &[0, 1], 1.0).is_err());
    }
}
