use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the VM and the integrators.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {
    /// Converts an `f64` constant, yielding NaN if the type cannot represent it.
    fn constant(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// A controlled continuous-time system `dx/dt = f(x, u)`.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn state_dimension(&self) -> usize;

    /// Returns the number of control inputs.
    fn control_dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// u: control, held constant over the integration interval
    /// out: buffer to write dx/dt
    fn apply(&self, x: &[T], u: &[T], out: &mut [T]);
}

/// Systems that can report their Jacobians alongside the vector field.
pub trait Linearize: DynamicalSystem<f64> {
    /// Writes `f(x, u)` into `f`, `df/dx` (row-major, nx × nx) into `jx`
    /// and `df/du` (row-major, nx × nu) into `ju`.
    fn linearize(&self, x: &[f64], u: &[f64], f: &mut [f64], jx: &mut [f64], ju: &mut [f64]);
}
