mod netting;
mod validation;

pub use netting::{NettingCalculator, NettingStep, Positions, PriceAccumulator};
pub use validation::{AcceptAll, ValidationRule, ValidationStep, Verdict};
