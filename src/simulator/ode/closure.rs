use super::Derivatives;
use diffsol::{
    ConstantOp, LinearOp, NonLinearOp, NonLinearOpJacobian, OdeEquations, OdeEquationsRef, Op,
};
use std::rc::Rc;

type T = f64;
type V = nalgebra::DVector<f64>;
type M = nalgebra::DMatrix<f64>;

/// How the solver obtains Jacobian-vector products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMode {
    /// Reaction-wise analytic product, touching only dependent entries.
    ReactionWise,
    /// Materialize the dense Jacobian, then multiply.
    Dense,
    /// Directional finite difference of the right-hand side.
    FiniteDifference,
}

pub struct NetRhs<'a> {
    nstates: usize,
    deriv: &'a Rc<dyn Derivatives>,
    mode: JacobianMode,
}

impl<'a> Op for NetRhs<'a> {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl<'a> NonLinearOp for NetRhs<'a> {
    fn call_inplace(&self, x: &Self::V, t: Self::T, y: &mut Self::V) {
        self.deriv.dydt(x, t, y);
    }
}

impl<'a> NonLinearOpJacobian for NetRhs<'a> {
    fn jac_mul_inplace(&self, x: &Self::V, t: Self::T, v: &Self::V, y: &mut Self::V) {
        match self.mode {
            JacobianMode::ReactionWise => self.deriv.jac_mul(x, t, v, y),
            JacobianMode::Dense => self.deriv.jac_mul_dense(x, t, v, y),
            JacobianMode::FiniteDifference => finite_difference_jac_mul(
                self.deriv.as_ref(),
                x,
                t,
                v,
                y,
            ),
        }
    }
}

/// Directional finite difference (f(x + eps v) - f(x)) / eps.
pub(super) fn finite_difference_jac_mul(
    deriv: &dyn Derivatives,
    x: &V,
    t: T,
    v: &V,
    y: &mut V,
) {
    let eps = 1e-8 * (1.0 + x.norm());
    let shifted = x + v * eps;
    let mut f0 = V::zeros(x.len());
    deriv.dydt(x, t, &mut f0);
    deriv.dydt(&shifted, t, y);
    y.axpy(-1.0 / eps, &f0, 1.0 / eps);
}

pub struct NetMass {
    nstates: usize,
}

impl Op for NetMass {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl LinearOp for NetMass {
    fn gemv_inplace(&self, _x: &Self::V, _t: Self::T, _beta: Self::T, _y: &mut Self::V) {}
}

pub struct NetInit {
    nstates: usize,
    init: V,
}

impl Op for NetInit {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl ConstantOp for NetInit {
    fn call_inplace(&self, _t: Self::T, y: &mut Self::V) {
        y.copy_from(&self.init);
    }
}

pub struct NetRoot {
    nstates: usize,
}

impl Op for NetRoot {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl NonLinearOp for NetRoot {
    fn call_inplace(&self, _x: &Self::V, _t: Self::T, _y: &mut Self::V) {}
}

pub struct NetOut {
    nstates: usize,
}

impl Op for NetOut {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl NonLinearOp for NetOut {
    fn call_inplace(&self, _x: &Self::V, _t: Self::T, _y: &mut Self::V) {}
}

/// The reaction network as a diffsol ODE problem.
///
/// Owns the derivative strategy and the initial concentration vector; the
/// parameter vector is empty because all kinetic constants live inside the
/// strategy.
pub struct NetProblem {
    deriv: Rc<dyn Derivatives>,
    nstates: usize,
    init: V,
    mode: JacobianMode,
}

impl NetProblem {
    pub fn new(deriv: Rc<dyn Derivatives>, init: V, mode: JacobianMode) -> Self {
        let nstates = init.len();
        Self {
            deriv,
            nstates,
            init,
            mode,
        }
    }
}

impl Op for NetProblem {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        0
    }
}

impl<'b> OdeEquationsRef<'b> for NetProblem {
    type Rhs = NetRhs<'b>;
    type Mass = NetMass;
    type Init = NetInit;
    type Root = NetRoot;
    type Out = NetOut;
}

impl OdeEquations for NetProblem {
    fn rhs(&self) -> NetRhs<'_> {
        NetRhs {
            nstates: self.nstates,
            deriv: &self.deriv,
            mode: self.mode,
        }
    }

    fn mass(&self) -> Option<NetMass> {
        None
    }

    fn init(&self) -> NetInit {
        NetInit {
            nstates: self.nstates,
            init: self.init.clone(),
        }
    }

    fn root(&self) -> Option<NetRoot> {
        None
    }

    fn out(&self) -> Option<NetOut> {
        None
    }

    fn get_params(&self, _p: &mut V) {}

    fn set_params(&mut self, _p: &V) {}
}
