//! Full-covariance Gaussian mixtures fitted with `linfa-clustering`.
//!
//! linfa runs the EM (k-means initialization, bounded iterations, covariance
//! regularization). This module checks the input, pins the RNG to the
//! caller's seed and turns the fitted parameters into [`Component`]s sorted
//! ascending by mean vector, so population indices do not depend on how the
//! initialization happened to label them. Posteriors are evaluated here, in
//! that canonical order.

use std::cmp::Ordering;
use std::f64::consts::PI;

use linfa::prelude::*;
use linfa_clustering::{GaussianMixtureModel, GmmCovarType, GmmInitMethod};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("{samples} events are not enough for {components} components")]
    TooFewSamples { samples: usize, components: usize },

    #[error("data contains no channels")]
    NoFeatures,

    #[error("data contains NaN or infinite values")]
    NonFinite,

    #[error("covariance of component {0} is not positive definite; increase reg_covar")]
    SingularCovariance(usize),

    /// Reported by linfa, including EM runs that did not converge.
    #[error("{0}")]
    Model(String),
}

/// Knobs for one fit. Every source of nondeterminism is pinned by `seed`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub n_components: usize,
    pub max_iter: usize,
    /// Stop once the mean log-likelihood improves by less than this.
    pub tol: f64,
    /// Added to covariance diagonals to keep them positive definite.
    pub reg_covar: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub weight: f64,
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Lower Cholesky factor of `covariance`.
    chol: DMatrix<f64>,
    log_det: f64,
}

impl Component {
    fn new(
        weight: f64,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        index: usize,
    ) -> Result<Self, FitError> {
        let chol = covariance
            .clone()
            .cholesky()
            .ok_or(FitError::SingularCovariance(index))?
            .l();
        let log_det = 2.0 * chol.diagonal().iter().map(|v| v.ln()).sum::<f64>();
        Ok(Component {
            weight,
            mean,
            covariance,
            chol,
            log_det,
        })
    }

    /// `ln N(x | mean, covariance)`.
    fn log_density(&self, x: &DVector<f64>) -> f64 {
        let d = x.len() as f64;
        let diff = x - &self.mean;
        let maha = match self.chol.solve_lower_triangular(&diff) {
            Some(z) => z.norm_squared(),
            None => f64::INFINITY,
        };
        -0.5 * (d * (2.0 * PI).ln() + self.log_det + maha)
    }
}

/// A fitted mixture. Rows of the input matrix are events, columns channels.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    components: Vec<Component>,
    log_likelihood: f64,
}

impl GaussianMixture {
    pub fn fit(data: &Array2<f64>, options: &FitOptions) -> Result<Self, FitError> {
        let (n, d) = data.dim();
        let k = options.n_components;
        if d == 0 {
            return Err(FitError::NoFeatures);
        }
        if k == 0 || n < k {
            return Err(FitError::TooFewSamples {
                samples: n,
                components: k,
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        let dataset = DatasetBase::from(data.clone());
        let model = GaussianMixtureModel::params(k)
            .covariance_type(GmmCovarType::Full)
            .init_method(GmmInitMethod::KMeans)
            .n_runs(1)
            .max_n_iterations(options.max_iter as u64)
            .tolerance(options.tol)
            .reg_covariance(options.reg_covar)
            .with_rng(<rand_linfa::rngs::StdRng as rand_linfa::SeedableRng>::seed_from_u64(options.seed))
            .fit(&dataset)
            .map_err(|e| FitError::Model(e.to_string()))?;

        let (means, covariances, weights) =
            (model.means(), model.covariances(), model.weights());
        let mut components = (0..k)
            .map(|j| {
                let mean = DVector::from_iterator(d, means.row(j).iter().copied());
                let covariance = DMatrix::from_fn(d, d, |a, b| covariances[[j, a, b]]);
                Component::new(weights[j], mean, covariance, j)
            })
            .collect::<Result<Vec<_>, _>>()?;
        components.sort_by(|a, b| compare_means(&a.mean, &b.mean));

        let mut gmm = GaussianMixture {
            components,
            log_likelihood: f64::NEG_INFINITY,
        };
        let total: f64 = data
            .rows()
            .into_iter()
            .map(|event| {
                let x = DVector::from_iterator(d, event.iter().copied());
                log_sum_exp(&gmm.weighted_log_densities(&x))
            })
            .sum();
        gmm.log_likelihood = total / n as f64;
        Ok(gmm)
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// One mean vector per component, in canonical order.
    pub fn means(&self) -> Vec<Vec<f64>> {
        self.components
            .iter()
            .map(|c| c.mean.iter().copied().collect())
            .collect()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.components.iter().map(|c| c.weight).collect()
    }

    /// Mean per-event log-likelihood of the training events.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Posterior membership probabilities of one event; sums to 1 for a
    /// finite event.
    pub fn predict_proba(&self, event: &[f64]) -> Vec<f64> {
        let weighted = self.weighted_log_densities(&DVector::from_column_slice(event));
        let norm = log_sum_exp(&weighted);
        weighted.iter().map(|w| (w - norm).exp()).collect()
    }

    /// Index of the most likely component for one event.
    pub fn predict(&self, event: &[f64]) -> usize {
        argmax(&self.predict_proba(event))
    }

    fn weighted_log_densities(&self, x: &DVector<f64>) -> Vec<f64> {
        self.components
            .iter()
            .map(|c| c.weight.ln() + c.log_density(x))
            .collect()
    }
}

pub(crate) fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn compare_means(a: &DVector<f64>, b: &DVector<f64>) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}
