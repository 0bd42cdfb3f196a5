//! Wire types for the UICP core: the envelope discriminated union, batches,
//! and the planner's plan shape. Pure serde data; no I/O lives here.

mod envelope;
mod plan;

pub use envelope::ApiCallParams;
pub use envelope::Batch;
pub use envelope::ComponentIdParams;
pub use envelope::ComponentRenderParams;
pub use envelope::ComponentUpdateParams;
pub use envelope::DomParams;
pub use envelope::Envelope;
pub use envelope::NeedsCodeParams;
pub use envelope::Operation;
pub use envelope::StateKeyParams;
pub use envelope::StateScope;
pub use envelope::StateValueParams;
pub use envelope::TxnCancelParams;
pub use envelope::WindowCreateParams;
pub use envelope::WindowGeometryParams;
pub use envelope::WindowIdParams;
pub use envelope::WindowUpdateParams;
pub use plan::Plan;
pub use plan::Risks;
