//! Model pricing (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Per-token (input, output) pricing keyed by model-name prefix.
///
/// Longer prefixes are listed first so the most specific entry wins.
const PRICING: &[(&str, Decimal, Decimal)] = &[
    ("claude-3-5-haiku", dec!(0.0000008), dec!(0.000004)),
    ("claude-3-haiku", dec!(0.00000025), dec!(0.00000125)),
    ("claude-3-5-sonnet", dec!(0.000003), dec!(0.000015)),
    ("claude-sonnet-4", dec!(0.000003), dec!(0.000015)),
    ("claude-opus-4", dec!(0.000015), dec!(0.000075)),
    ("gpt-4o-mini", dec!(0.00000015), dec!(0.0000006)),
    ("gpt-4o", dec!(0.0000025), dec!(0.00001)),
    ("gpt-4.1-mini", dec!(0.0000004), dec!(0.0000016)),
    ("gpt-4.1", dec!(0.000002), dec!(0.000008)),
];

/// Unknown models are priced like a mid-tier model.
const DEFAULT_PRICING: (Decimal, Decimal) = (dec!(0.000003), dec!(0.000015));

/// Look up per-token pricing for a model. Unknown models get the default.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_PRICING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_prefix_matches() {
        let (input, output) = model_cost("claude-3-5-sonnet-20240620");
        assert_eq!(input, dec!(0.000003));
        assert_eq!(output, dec!(0.000015));
    }

    #[test]
    fn mini_variant_beats_base_prefix() {
        let (input, _) = model_cost("gpt-4o-mini-2024-07-18");
        assert_eq!(input, dec!(0.00000015));
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(model_cost("some-local-model"), DEFAULT_PRICING);
    }
}
