//! Dueling Q-network with a multi-head attention block over the encoded
//! state, trained by hand-rolled backpropagation with Adam.
//!
//! The state is a single token, so the attention softmax is over one key and
//! saturates at 1: the context equals the value projection and the query/key
//! projections receive zero gradient. They are kept so the architecture (and
//! its checkpoints) match the published network shape.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fully connected layer; bias is stored as a 1xN row broadcast over the batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub w: Array2<f64>,
    pub b: Array2<f64>,
}

impl Linear {
    fn new(input: usize, output: usize, rng: &mut StdRng) -> Self {
        // Xavier-uniform initialization
        let limit = (6.0 / (input + output) as f64).sqrt();
        let w = Array2::from_shape_fn((input, output), |_| rng.gen_range(-limit..limit));
        let b = Array2::zeros((1, output));
        Self { w, b }
    }

    fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.w) + &self.b
    }
}

fn relu(x: &Array2<f64>) -> Array2<f64> {
    x.mapv(|v| v.max(0.0))
}

fn relu_grad(pre: &Array2<f64>, upstream: &Array2<f64>) -> Array2<f64> {
    let mask = pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
    upstream * &mask
}

/// Q-network: encoder MLP, attention block, dueling value/advantage heads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QNetwork {
    pub enc1: Linear,
    pub enc2: Linear,
    pub attn_q: Linear,
    pub attn_k: Linear,
    pub attn_v: Linear,
    pub attn_o: Linear,
    pub val1: Linear,
    pub val2: Linear,
    pub adv1: Linear,
    pub adv2: Linear,
    pub heads: usize,
}

/// Cached activations of one forward pass, consumed by `backward`
pub struct ForwardCache {
    x: Array2<f64>,
    h1_pre: Array2<f64>,
    h1: Array2<f64>,
    h2_pre: Array2<f64>,
    h2: Array2<f64>,
    v_proj: Array2<f64>,
    att: Array2<f64>,
    v1_pre: Array2<f64>,
    v1: Array2<f64>,
    a1_pre: Array2<f64>,
    a1: Array2<f64>,
    pub q: Array2<f64>,
}

/// Per-parameter gradients in the order of [`QNetwork::params`]
pub type Gradients = Vec<Array2<f64>>;

impl QNetwork {
    pub fn new(state_dim: usize, action_dim: usize, hidden: usize, heads: usize, rng: &mut StdRng) -> Self {
        let half = (hidden / 2).max(1);
        Self {
            enc1: Linear::new(state_dim, hidden, rng),
            enc2: Linear::new(hidden, hidden, rng),
            attn_q: Linear::new(hidden, hidden, rng),
            attn_k: Linear::new(hidden, hidden, rng),
            attn_v: Linear::new(hidden, hidden, rng),
            attn_o: Linear::new(hidden, hidden, rng),
            val1: Linear::new(hidden, half, rng),
            val2: Linear::new(half, 1, rng),
            adv1: Linear::new(hidden, half, rng),
            adv2: Linear::new(half, action_dim, rng),
            heads,
        }
    }

    /// Q-values for a batch of states
    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        self.forward_cached(x).q
    }

    pub fn forward_cached(&self, x: &Array2<f64>) -> ForwardCache {
        let h1_pre = self.enc1.forward(x);
        let h1 = relu(&h1_pre);
        let h2_pre = self.enc2.forward(&h1);
        let h2 = relu(&h2_pre);

        // Attention over the single state token: the scores exist, but the
        // softmax over one key is identically 1, so the context is V
        let _q_proj = self.attn_q.forward(&h2);
        let _k_proj = self.attn_k.forward(&h2);
        let v_proj = self.attn_v.forward(&h2);
        let att = self.attn_o.forward(&v_proj);

        let v1_pre = self.val1.forward(&att);
        let v1 = relu(&v1_pre);
        let value = self.val2.forward(&v1);

        let a1_pre = self.adv1.forward(&att);
        let a1 = relu(&a1_pre);
        let adv = self.adv2.forward(&a1);

        // Q(s,a) = V(s) + A(s,a) - mean_a A(s,a); the (batch, 1) terms
        // broadcast over the action axis
        let mean_adv = adv
            .mean_axis(Axis(1))
            .expect("non-empty action axis")
            .insert_axis(Axis(1));
        let q = &adv - &mean_adv + &value;

        ForwardCache {
            x: x.clone(),
            h1_pre,
            h1,
            h2_pre,
            h2,
            v_proj,
            att,
            v1_pre,
            v1,
            a1_pre,
            a1,
            q,
        }
    }

    /// Backpropagate dL/dQ and return gradients aligned with [`Self::params`]
    pub fn backward(&self, cache: &ForwardCache, dq: &Array2<f64>) -> Gradients {
        // Dueling combination
        let dvalue = dq.sum_axis(Axis(1)).insert_axis(Axis(1));
        let dq_mean = dq
            .mean_axis(Axis(1))
            .expect("non-empty action axis")
            .insert_axis(Axis(1));
        let dadv = dq - &dq_mean;

        // Advantage head
        let (dw_adv2, db_adv2, da1) = linear_backward(&self.adv2, &cache.a1, &dadv);
        let da1_pre = relu_grad(&cache.a1_pre, &da1);
        let (dw_adv1, db_adv1, datt_a) = linear_backward(&self.adv1, &cache.att, &da1_pre);

        // Value head
        let (dw_val2, db_val2, dv1) = linear_backward(&self.val2, &cache.v1, &dvalue);
        let dv1_pre = relu_grad(&cache.v1_pre, &dv1);
        let (dw_val1, db_val1, datt_v) = linear_backward(&self.val1, &cache.att, &dv1_pre);

        let datt = &datt_a + &datt_v;

        // Attention: only the value/output projections carry gradient; the
        // singleton softmax has zero derivative with respect to the scores
        let (dw_o, db_o, dv_proj) = linear_backward(&self.attn_o, &cache.v_proj, &datt);
        let (dw_v, db_v, dh2) = linear_backward(&self.attn_v, &cache.h2, &dv_proj);
        let dw_q = Array2::zeros(self.attn_q.w.raw_dim());
        let db_q = Array2::zeros(self.attn_q.b.raw_dim());
        let dw_k = Array2::zeros(self.attn_k.w.raw_dim());
        let db_k = Array2::zeros(self.attn_k.b.raw_dim());

        // Encoder
        let dh2_pre = relu_grad(&cache.h2_pre, &dh2);
        let (dw_enc2, db_enc2, dh1) = linear_backward(&self.enc2, &cache.h1, &dh2_pre);
        let dh1_pre = relu_grad(&cache.h1_pre, &dh1);
        let (dw_enc1, db_enc1, _dx) = linear_backward(&self.enc1, &cache.x, &dh1_pre);

        vec![
            dw_enc1, db_enc1, dw_enc2, db_enc2, dw_q, db_q, dw_k, db_k, dw_v, db_v, dw_o, db_o,
            dw_val1, db_val1, dw_val2, db_val2, dw_adv1, db_adv1, dw_adv2, db_adv2,
        ]
    }

    /// Parameters in a stable order shared with gradients and Adam state
    pub fn params(&self) -> Vec<&Array2<f64>> {
        vec![
            &self.enc1.w,
            &self.enc1.b,
            &self.enc2.w,
            &self.enc2.b,
            &self.attn_q.w,
            &self.attn_q.b,
            &self.attn_k.w,
            &self.attn_k.b,
            &self.attn_v.w,
            &self.attn_v.b,
            &self.attn_o.w,
            &self.attn_o.b,
            &self.val1.w,
            &self.val1.b,
            &self.val2.w,
            &self.val2.b,
            &self.adv1.w,
            &self.adv1.b,
            &self.adv2.w,
            &self.adv2.b,
        ]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Array2<f64>> {
        vec![
            &mut self.enc1.w,
            &mut self.enc1.b,
            &mut self.enc2.w,
            &mut self.enc2.b,
            &mut self.attn_q.w,
            &mut self.attn_q.b,
            &mut self.attn_k.w,
            &mut self.attn_k.b,
            &mut self.attn_v.w,
            &mut self.attn_v.b,
            &mut self.attn_o.w,
            &mut self.attn_o.b,
            &mut self.val1.w,
            &mut self.val1.b,
            &mut self.val2.w,
            &mut self.val2.b,
            &mut self.adv1.w,
            &mut self.adv1.b,
            &mut self.adv2.w,
            &mut self.adv2.b,
        ]
    }

    /// Hard-copy weights from another network (target sync)
    pub fn copy_from(&mut self, other: &QNetwork) {
        *self = other.clone();
    }
}

/// dW, db, dx for one fully connected layer
fn linear_backward(
    layer: &Linear,
    input: &Array2<f64>,
    upstream: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let dw = input.t().dot(upstream);
    let db = upstream.sum_axis(Axis(0)).insert_axis(Axis(0));
    let dx = upstream.dot(&layer.w.t());
    (dw, db, dx)
}

/// Adam optimizer with global-norm gradient clipping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    clip_norm: f64,
    t: u64,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(lr: f64, network: &QNetwork) -> Self {
        let shapes: Vec<Array2<f64>> = network
            .params()
            .iter()
            .map(|p| Array2::zeros(p.raw_dim()))
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            clip_norm: 1.0,
            t: 0,
            m: shapes.clone(),
            v: shapes,
        }
    }

    pub fn step(&mut self, network: &mut QNetwork, mut grads: Gradients) {
        // Clip at global L2 norm
        let norm: f64 = grads
            .iter()
            .map(|g| g.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt();
        if norm > self.clip_norm {
            let scale = self.clip_norm / norm;
            for g in &mut grads {
                g.mapv_inplace(|v| v * scale);
            }
        }

        self.t += 1;
        let t = self.t as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);

        for ((param, grad), (m, v)) in network
            .params_mut()
            .into_iter()
            .zip(grads.into_iter())
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            *m = &*m * self.beta1 + &(&grad * (1.0 - self.beta1));
            *v = &*v * self.beta2 + &(&grad.mapv(|g| g * g) * (1.0 - self.beta2));
            let m_hat = &*m / correction1;
            let v_hat = &*v / correction2;
            let update = &m_hat / &(v_hat.mapv(f64::sqrt) + self.eps);
            *param -= &(&update * self.lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn network() -> QNetwork {
        let mut rng = StdRng::seed_from_u64(9);
        QNetwork::new(6, 9, 32, 8, &mut rng)
    }

    #[test]
    fn test_forward_shape_and_dueling_identity() {
        let net = network();
        let x = Array2::from_shape_fn((4, 6), |(i, j)| (i + j) as f64 / 10.0);
        let q = net.forward(&x);
        assert_eq!(q.shape(), &[4, 9]);

        // The dueling combination subtracts the advantage mean, so shifting
        // all advantages by a constant cannot change Q differences
        let row = q.row(0);
        let spread = row.iter().cloned().fold(f64::MIN, f64::max)
            - row.iter().cloned().fold(f64::MAX, f64::min);
        assert!(spread.is_finite());
    }

    #[test]
    fn test_forward_deterministic_per_seed() {
        let a = network();
        let b = network();
        let x = Array2::from_shape_fn((2, 6), |(i, j)| (i * 6 + j) as f64 / 12.0);
        assert_eq!(a.forward(&x), b.forward(&x));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut net = network();
        let x = array![[0.2, 0.4, 0.1, 0.9, 0.3, 0.5]];
        let action = 2usize;

        // Loss = Q(s, a); gradient check on one encoder weight
        let cache = net.forward_cached(&x);
        let mut dq = Array2::zeros(cache.q.raw_dim());
        dq[[0, action]] = 1.0;
        let grads = net.backward(&cache, &dq);
        let analytic = grads[0][[1, 3]];

        let epsilon = 1e-6;
        let original = net.enc1.w[[1, 3]];
        net.enc1.w[[1, 3]] = original + epsilon;
        let plus = net.forward(&x)[[0, action]];
        net.enc1.w[[1, 3]] = original - epsilon;
        let minus = net.forward(&x)[[0, action]];
        net.enc1.w[[1, 3]] = original;

        let numeric = (plus - minus) / (2.0 * epsilon);
        assert!(
            (analytic - numeric).abs() < 1e-5,
            "analytic {analytic} vs numeric {numeric}"
        );
    }

    #[test]
    fn test_adam_reduces_simple_loss() {
        let mut net = network();
        let mut adam = Adam::new(0.01, &net);
        let x = Array2::from_shape_fn((8, 6), |(i, j)| ((i * 7 + j) % 10) as f64 / 10.0);
        let target = 1.5f64;

        let initial: f64 = {
            let q = net.forward(&x);
            q.column(0).iter().map(|v| (v - target).powi(2)).sum()
        };
        for _ in 0..200 {
            let cache = net.forward_cached(&x);
            let mut dq = Array2::zeros(cache.q.raw_dim());
            for i in 0..x.nrows() {
                dq[[i, 0]] = 2.0 * (cache.q[[i, 0]] - target) / x.nrows() as f64;
            }
            let grads = net.backward(&cache, &dq);
            adam.step(&mut net, grads);
        }
        let trained: f64 = {
            let q = net.forward(&x);
            q.column(0).iter().map(|v| (v - target).powi(2)).sum()
        };
        assert!(
            trained < initial * 0.5,
            "loss should halve: {initial} -> {trained}"
        );
    }

    #[test]
    fn test_target_sync_copies_weights() {
        let mut online = network();
        let mut rng = StdRng::seed_from_u64(77);
        let mut target = QNetwork::new(6, 9, 32, 8, &mut rng);
        let x = Array2::from_shape_fn((1, 6), |(_, j)| j as f64 / 6.0);
        assert_ne!(online.forward(&x), target.forward(&x));
        target.copy_from(&online);
        assert_eq!(online.forward(&x), target.forward(&x));

        // Sync direction: mutating online afterwards must not affect target
        online.enc1.w[[0, 0]] += 1.0;
        assert_ne!(online.forward(&x), target.forward(&x));
    }
}
