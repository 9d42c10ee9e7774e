pub mod config;
pub mod error;
pub mod metrics;
pub mod operator;
pub mod reconcile;
pub mod util;
pub mod validator;
pub mod waiter;

pub use config::DeployerConfig;
pub use error::{
    CapacityError, ConvergenceError, DeployError, Phase, ReconcileError, ReconcileFailure,
    SoftFailure,
};
pub use metrics::SharedMetrics;
pub use operator::ObservedDeployment;
pub use reconcile::{DeployOutcome, Deployer};
