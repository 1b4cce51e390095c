pub mod engine;
pub mod evaluator;
pub mod expr;
pub mod group;
pub mod inhibit;
pub mod route;
pub mod rule;
pub mod state;
pub mod template;

pub use engine::{ActiveAlert, AlertEngine, EngineOptions};
pub use evaluator::{RuleEvaluator, RuleHealth, RuleRuntime};
pub use expr::{parse_condition, parse_expr, parse_matchers, Condition, Expr};
pub use group::{GroupRuntime, RuleStatus};
pub use inhibit::{InhibitRule, InhibitRuleDefinition, Inhibitor, Suppression};
pub use route::{RouteConfig, Router};
pub use rule::{AlertRule, RuleDefinition, RuleGroup, RuleGroupDefinition};
pub use state::{AlertInstance, AlertState, AlertStateMachine, Transition, TransitionRecord};
pub use template::Template;
