mod catalog;
mod descriptor;

pub use catalog::{BackendCatalog, LadderPlan};
pub use descriptor::{
    BackendDescriptor, LastResortDescriptor, OutputShape, ParamNames, TriggerPlacement,
};
