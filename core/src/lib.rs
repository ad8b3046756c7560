//! Execution engine for API test case steps: HTTP requests, database
//! queries and plugins, with extraction and validation over their results.

pub mod error;
pub mod eval;
pub mod extract;
pub mod metadata;
pub mod plugin;
pub mod response;
pub mod runner;
pub mod scope;
pub mod sql;
pub mod step;
pub mod transport;
pub mod validate;

pub use error::{StepError, StepFailure};
pub use eval::{Evaluator, FunctionRegistry, TemplateEvaluator};
pub use metadata::{
    ExecutionMetadata, ExecutionStatus, MetadataEntry, MetadataRecorder, StepKind, TimingStats,
};
pub use plugin::{Plugin, PluginDispatcher, PluginRegistry};
pub use response::{PluginOutput, ResultVariant, StepResult};
pub use runner::{CaseReport, Collaborators, Runner, RunnerSettings};
pub use scope::{Declarations, VariableScope, Variables};
pub use sql::driver::{Connection, DatabaseDriver, DriverError, RowSet};
pub use sql::sqlx_driver::SqlxDriver;
pub use sql::{DatabaseResultSet, SqlExecutor, StatementKind};
pub use step::{CaseConfig, Hook, StepBody, StepSpec, TestCase};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
pub use validate::{Comparator, Validator, ValidatorResult};
