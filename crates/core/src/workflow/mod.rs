pub mod capture;
pub mod condition;
pub mod executor;
pub mod parser;
pub mod step_executor;
pub mod workspace;

pub use condition::ConditionEvaluator;
pub use executor::{ExecuteOptions, Run, WorkflowExecutor};
pub use parser::{load_workflow, parse_workflow, FileFormat};
pub use step_executor::{RetryBackoff, StepExecutor};
pub use workspace::{FactValue, StepOutcome, Workspace};
