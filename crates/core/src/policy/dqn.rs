use ndarray::{Array, Array1, Array2, Axis, Dimension, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::state::{ACTION_DIM, STATE_DIM};
use super::{PolicyState, Transition, ValueModel};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;
const GRAD_CLIP: f32 = 1.0;

/// Weights of the three-layer value network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
    w3: Array2<f32>,
    b3: Array1<f32>,
}

impl Params {
    fn random<R: Rng + ?Sized>(hidden: usize, rng: &mut R) -> Self {
        let (w1, b1) = layer(STATE_DIM, hidden, rng);
        let (w2, b2) = layer(hidden, hidden, rng);
        let (w3, b3) = layer(hidden, ACTION_DIM, rng);
        Self { w1, b1, w2, b2, w3, b3 }
    }

    fn zeros_like(other: &Params) -> Self {
        Self {
            w1: Array2::zeros(other.w1.raw_dim()),
            b1: Array1::zeros(other.b1.raw_dim()),
            w2: Array2::zeros(other.w2.raw_dim()),
            b2: Array1::zeros(other.b2.raw_dim()),
            w3: Array2::zeros(other.w3.raw_dim()),
            b3: Array1::zeros(other.b3.raw_dim()),
        }
    }

    fn clamp(&mut self, limit: f32) {
        let f = |g: f32| g.clamp(-limit, limit);
        self.w1.mapv_inplace(f);
        self.b1.mapv_inplace(f);
        self.w2.mapv_inplace(f);
        self.b2.mapv_inplace(f);
        self.w3.mapv_inplace(f);
        self.b3.mapv_inplace(f);
    }
}

fn layer<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> (Array2<f32>, Array1<f32>) {
    let bound = 1.0 / (fan_in as f32).sqrt();
    (
        Array2::random_using((fan_in, fan_out), Uniform::new(-bound, bound), rng),
        Array1::random_using(fan_out, Uniform::new(-bound, bound), rng),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Adam {
    m: Params,
    v: Params,
    t: i32,
}

struct Forward {
    x: Array2<f32>,
    z1: Array2<f32>,
    h1: Array2<f32>,
    z2: Array2<f32>,
    h2: Array2<f32>,
    q: Array2<f32>,
}

/// Parametric value function: `state -> value per action`, trained with Adam
/// on a smooth-L1 loss against observed rewards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNetwork {
    hidden: usize,
    params: Params,
    adam: Adam,
}

impl ValueNetwork {
    /// Randomly initialized network with `hidden` units per hidden layer.
    pub fn new<R: Rng + ?Sized>(hidden: usize, rng: &mut R) -> Self {
        let hidden = hidden.max(1);
        let params = Params::random(hidden, rng);
        let adam = Adam {
            m: Params::zeros_like(&params),
            v: Params::zeros_like(&params),
            t: 0,
        };
        Self {
            hidden,
            params,
            adam,
        }
    }

    /// Units per hidden layer.
    pub fn hidden_units(&self) -> usize {
        self.hidden
    }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> i32 {
        self.adam.t
    }

    fn forward(&self, x: Array2<f32>) -> Forward {
        let p = &self.params;
        let z1 = x.dot(&p.w1) + &p.b1;
        let h1 = z1.mapv(relu);
        let z2 = h1.dot(&p.w2) + &p.b2;
        let h2 = z2.mapv(relu);
        let q = h2.dot(&p.w3) + &p.b3;
        Forward {
            x,
            z1,
            h1,
            z2,
            h2,
            q,
        }
    }

    fn backward(&self, f: &Forward, dq: &Array2<f32>) -> Params {
        let p = &self.params;
        let w3 = f.h2.t().dot(dq);
        let b3 = dq.sum_axis(Axis(0));
        let dh2 = dq.dot(&p.w3.t()) * &f.z2.mapv(relu_grad);
        let w2 = f.h1.t().dot(&dh2);
        let b2 = dh2.sum_axis(Axis(0));
        let dh1 = dh2.dot(&p.w2.t()) * &f.z1.mapv(relu_grad);
        let w1 = f.x.t().dot(&dh1);
        let b1 = dh1.sum_axis(Axis(0));
        Params { w1, b1, w2, b2, w3, b3 }
    }

    /// One optimizer step on a batch. Returns the mean smooth-L1 loss before the step.
    pub fn train_step(&mut self, batch: &[Transition], lr: f32) -> f32 {
        let n = batch.len();
        if n == 0 {
            return 0.0;
        }
        let mut x = Array2::zeros((n, STATE_DIM));
        for (i, t) in batch.iter().enumerate() {
            for (j, v) in t.state.encode().iter().enumerate() {
                x[[i, j]] = *v;
            }
        }
        let fwd = self.forward(x);

        let mut dq = Array2::zeros((n, ACTION_DIM));
        let mut loss = 0.0;
        for (i, t) in batch.iter().enumerate() {
            let diff = fwd.q[[i, t.action]] - t.reward as f32;
            loss += if diff.abs() < 1.0 {
                0.5 * diff * diff
            } else {
                diff.abs() - 0.5
            };
            dq[[i, t.action]] = diff.clamp(-1.0, 1.0) / n as f32;
        }

        let mut grads = self.backward(&fwd, &dq);
        grads.clamp(GRAD_CLIP);
        self.apply_adam(&grads, lr);
        loss / n as f32
    }

    fn apply_adam(&mut self, g: &Params, lr: f32) {
        self.adam.t += 1;
        let t = self.adam.t;
        let (p, m, v) = (&mut self.params, &mut self.adam.m, &mut self.adam.v);
        adam_update(&mut p.w1, &g.w1, &mut m.w1, &mut v.w1, lr, t);
        adam_update(&mut p.b1, &g.b1, &mut m.b1, &mut v.b1, lr, t);
        adam_update(&mut p.w2, &g.w2, &mut m.w2, &mut v.w2, lr, t);
        adam_update(&mut p.b2, &g.b2, &mut m.b2, &mut v.b2, lr, t);
        adam_update(&mut p.w3, &g.w3, &mut m.w3, &mut v.w3, lr, t);
        adam_update(&mut p.b3, &g.b3, &mut m.b3, &mut v.b3, lr, t);
    }
}

impl ValueModel for ValueNetwork {
    fn values(&self, state: &PolicyState) -> [f64; ACTION_DIM] {
        let x = Array2::from_shape_vec((1, STATE_DIM), state.encode().to_vec())
            .unwrap_or_else(|_| Array2::zeros((1, STATE_DIM)));
        let q = self.forward(x).q;
        let mut out = [0.0; ACTION_DIM];
        for (a, v) in out.iter_mut().enumerate() {
            *v = q[[0, a]] as f64;
        }
        out
    }
}

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

fn relu_grad(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn adam_update<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    lr: f32,
    t: i32,
) {
    let bc1 = 1.0 - BETA1.powi(t);
    let bc2 = 1.0 - BETA2.powi(t);
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = BETA1 * *m + (1.0 - BETA1) * g;
            *v = BETA2 * *v + (1.0 - BETA2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
        });
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::model::{LengthCategory, TopicCategory};

    #[test]
    fn steps_move_value_toward_reward() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut net = ValueNetwork::new(16, &mut rng);
        let state = PolicyState::new(TopicCategory::Routing, LengthCategory::Long);
        let batch = vec![
            Transition {
                state,
                action: 2,
                reward: 5.0,
            };
            8
        ];
        let before = (net.values(&state)[2] - 5.0).abs();
        let mut last_loss = f32::MAX;
        for _ in 0..1000 {
            last_loss = net.train_step(&batch, 1e-2);
        }
        let after = (net.values(&state)[2] - 5.0).abs();
        assert!(after < before, "gap {before} -> {after}");
        assert!(last_loss < 0.5);
        assert_eq!(net.steps(), 1000);
    }

    #[test]
    fn serde_preserves_predictions() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = ValueNetwork::new(8, &mut rng);
        let json = serde_json::to_string(&net).unwrap();
        let back: ValueNetwork = serde_json::from_str(&json).unwrap();
        let s = PolicyState::default();
        assert_eq!(net.values(&s), back.values(&s));
    }
}
