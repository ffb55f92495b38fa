//! Reverse-mode automatic differentiation.
//!
//! Every posterior evaluation records its arithmetic on a [`Tape`]. A single
//! backward sweep then yields the derivative of one output node with respect
//! to every recorded input, which is what the gradient-returning output modes
//! and the optimizers need.
//!
//! ```
//! use sed_posterior::tape::Tape;
//!
//! let mut tape = Tape::new();
//! let x = tape.var(2.0);
//! let y = tape.var(4.0);
//! let xy = tape.mul(x, y);
//! let out = tape.sub(xy, x);
//! tape.backward(out);
//! assert_eq!(tape.val(out), 6.0);
//! assert_eq!(tape.adjoint(x), 3.0);
//! assert_eq!(tape.adjoint(y), 2.0);
//! ```

use std::f64::consts::LN_10;

/// Handle to a node on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(usize);

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    Const,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    Ln(usize),
    Exp(usize),
    Powi(usize, i32),
    Scale(usize, f64),
}

#[derive(Debug, Clone)]
struct Node {
    val: f64,
    op: Op,
}

/// A recorded computation graph with its adjoints.
#[derive(Debug, Default, Clone)]
pub struct Tape {
    nodes: Vec<Node>,
    adjoints: Vec<f64>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            adjoints: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop all nodes but keep the allocation.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.adjoints.clear();
    }

    #[inline]
    fn push(&mut self, val: f64, op: Op) -> Var {
        self.nodes.push(Node { val, op });
        Var(self.nodes.len() - 1)
    }

    /// Record a differentiable input.
    #[inline]
    pub fn var(&mut self, val: f64) -> Var {
        self.push(val, Op::Leaf)
    }

    /// Record one input per value.
    pub fn vars(&mut self, vals: &[f64]) -> Vec<Var> {
        vals.iter().map(|&val| self.var(val)).collect()
    }

    /// Record a constant; no adjoint flows into it.
    #[inline]
    pub fn constant(&mut self, val: f64) -> Var {
        self.push(val, Op::Const)
    }

    #[inline]
    pub fn val(&self, v: Var) -> f64 {
        self.nodes[v.0].val
    }

    pub fn vals(&self, vars: &[Var]) -> Vec<f64> {
        vars.iter().map(|&v| self.val(v)).collect()
    }

    #[inline]
    pub fn add(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) + self.val(b), Op::Add(a.0, b.0))
    }

    #[inline]
    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) - self.val(b), Op::Sub(a.0, b.0))
    }

    #[inline]
    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) * self.val(b), Op::Mul(a.0, b.0))
    }

    #[inline]
    pub fn div(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) / self.val(b), Op::Div(a.0, b.0))
    }

    #[inline]
    pub fn neg(&mut self, a: Var) -> Var {
        self.push(-self.val(a), Op::Neg(a.0))
    }

    #[inline]
    pub fn ln(&mut self, a: Var) -> Var {
        self.push(self.val(a).ln(), Op::Ln(a.0))
    }

    #[inline]
    pub fn exp(&mut self, a: Var) -> Var {
        self.push(self.val(a).exp(), Op::Exp(a.0))
    }

    #[inline]
    pub fn powi(&mut self, a: Var, n: i32) -> Var {
        self.push(self.val(a).powi(n), Op::Powi(a.0, n))
    }

    /// `a * s` for a plain scalar `s`.
    #[inline]
    pub fn scale(&mut self, a: Var, s: f64) -> Var {
        self.push(self.val(a) * s, Op::Scale(a.0, s))
    }

    /// `a + s` for a plain scalar `s`.
    pub fn add_f64(&mut self, a: Var, s: f64) -> Var {
        let c = self.constant(s);
        self.add(a, c)
    }

    /// `a - s` for a plain scalar `s`.
    pub fn sub_f64(&mut self, a: Var, s: f64) -> Var {
        let c = self.constant(s);
        self.sub(a, c)
    }

    /// `a / s` for a plain scalar `s`.
    pub fn div_f64(&mut self, a: Var, s: f64) -> Var {
        self.scale(a, s.recip())
    }

    /// `10^a`
    pub fn pow10(&mut self, a: Var) -> Var {
        let scaled = self.scale(a, LN_10);
        self.exp(scaled)
    }

    /// Sum of all terms. An empty slice sums to a zero constant.
    pub fn sum(&mut self, terms: &[Var]) -> Var {
        let Some((&first, rest)) = terms.split_first() else {
            return self.constant(0.);
        };
        rest.iter().fold(first, |acc, &term| self.add(acc, term))
    }

    /// Propagate adjoints from `out` back to every node recorded before it.
    pub fn backward(&mut self, out: Var) {
        self.adjoints.clear();
        self.adjoints.resize(self.nodes.len(), 0.);
        self.adjoints[out.0] = 1.;

        for i in (0..=out.0).rev() {
            let adj = self.adjoints[i];
            if adj == 0. {
                continue;
            }
            match self.nodes[i].op {
                Op::Leaf | Op::Const => {}
                Op::Add(a, b) => {
                    self.adjoints[a] += adj;
                    self.adjoints[b] += adj;
                }
                Op::Sub(a, b) => {
                    self.adjoints[a] += adj;
                    self.adjoints[b] -= adj;
                }
                Op::Mul(a, b) => {
                    let (va, vb) = (self.nodes[a].val, self.nodes[b].val);
                    self.adjoints[a] += adj * vb;
                    self.adjoints[b] += adj * va;
                }
                Op::Div(a, b) => {
                    let (va, vb) = (self.nodes[a].val, self.nodes[b].val);
                    self.adjoints[a] += adj / vb;
                    self.adjoints[b] -= adj * va / (vb * vb);
                }
                Op::Neg(a) => self.adjoints[a] -= adj,
                Op::Ln(a) => self.adjoints[a] += adj / self.nodes[a].val,
                Op::Exp(a) => self.adjoints[a] += adj * self.nodes[i].val,
                Op::Powi(a, n) => {
                    self.adjoints[a] += adj * n as f64 * self.nodes[a].val.powi(n - 1)
                }
                Op::Scale(a, s) => self.adjoints[a] += adj * s,
            }
        }
    }

    /// d(out)/d(v) for the last [`backward`](Tape::backward) call.
    ///
    /// Nodes recorded after that call report zero.
    #[inline]
    pub fn adjoint(&self, v: Var) -> f64 {
        self.adjoints.get(v.0).copied().unwrap_or(0.)
    }

    pub fn adjoints(&self, vars: &[Var]) -> Vec<f64> {
        vars.iter().map(|&v| self.adjoint(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quotient_rule() {
        let mut tape = Tape::new();
        let x = tape.var(6.);
        let y = tape.var(3.);
        let z = tape.div(x, y);
        tape.backward(z);
        assert_eq!(tape.val(z), 2.);
        assert_relative_eq!(tape.adjoint(x), 1. / 3., epsilon = 1e-12);
        assert_relative_eq!(tape.adjoint(y), -6. / 9., epsilon = 1e-12);
    }

    #[test]
    fn pow10_derivative() {
        let mut tape = Tape::new();
        let x = tape.var(-0.5);
        let z = tape.pow10(x);
        tape.backward(z);
        assert_relative_eq!(tape.val(z), 10f64.powf(-0.5), epsilon = 1e-12);
        assert_relative_eq!(tape.adjoint(x), 10f64.powf(-0.5) * LN_10, epsilon = 1e-12);
    }

    #[test]
    fn shared_subexpressions_accumulate() {
        // f = x^2 * ln(x) + x
        let mut tape = Tape::new();
        let x = tape.var(2.);
        let sq = tape.powi(x, 2);
        let lx = tape.ln(x);
        let prod = tape.mul(sq, lx);
        let f = tape.add(prod, x);
        tape.backward(f);

        let expected = 2. * 2. * 2f64.ln() + 2. + 1.;
        assert_relative_eq!(tape.adjoint(x), expected, epsilon = 1e-12);
    }

    #[test]
    fn constants_receive_no_adjoint() {
        let mut tape = Tape::new();
        let x = tape.var(1.5);
        let shifted = tape.sub_f64(x, 4.);
        let f = tape.scale(shifted, -2.);
        tape.backward(f);
        assert_eq!(tape.adjoint(x), -2.);
        assert_eq!(tape.val(f), 5.);
    }

    #[test]
    fn sum_of_nothing_is_zero() {
        let mut tape = Tape::new();
        let s = tape.sum(&[]);
        assert_eq!(tape.val(s), 0.);
    }

    #[test]
    fn backward_can_be_rerun_on_other_outputs() {
        let mut tape = Tape::new();
        let x = tape.var(3.);
        let a = tape.exp(x);
        let b = tape.neg(x);
        tape.backward(a);
        assert_relative_eq!(tape.adjoint(x), 3f64.exp(), epsilon = 1e-12);
        tape.backward(b);
        assert_eq!(tape.adjoint(x), -1.);
    }
}
