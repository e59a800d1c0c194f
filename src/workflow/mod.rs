//! Process model and structural validation for packed workflow documents.

mod types;
mod validator;

pub use types::{
    local_name, Argument, CommandLineBinding, CwlType, OutputBinding, PackedWorkflow, Parameter,
    Parameters, Process, ProcessClass, Requirement, ScatterMethod, Step, StepInput,
};
pub use validator::{validate, ValidationReport};
