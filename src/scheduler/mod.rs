pub mod autodj;
pub mod compatibility;
pub mod events;
pub mod mix_scheduler;
pub mod stem_schedule;
pub mod transition_planner;

pub use autodj::{OrchestratorConfig, OrchestratorHandle, TransitionOrchestrator};
pub use compatibility::{CompatibilityEvaluator, CompatibilityScore};
pub use events::{EventBus, MixEvent};
pub use mix_scheduler::MixScheduler;
pub use stem_schedule::{StemPhase, StemSchedule};
pub use transition_planner::{TransitionPlan, TransitionPlanner, TransitionStyle};
