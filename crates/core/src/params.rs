//! Workflow parameterization.
//!
//! Mutates a loaded [`Workflow`] in place before submission: fresh random
//! seeds for sampler nodes, and caller-supplied values for the primitive
//! nodes whose title marks them as parameter inputs.

use rand::Rng;
use serde_json::Value;

use crate::workflow::{TitleSource, Workflow};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Input fields holding a sampler seed.
pub const SEED_INPUTS: [&str; 2] = ["seed", "noise_seed"];

/// Input field written by titled parameter nodes.
pub const VALUE_INPUT: &str = "value";

/// Largest seed drawn (`i64::MAX`, so the value survives signed parsing
/// on the server).
pub const MAX_SEED: u64 = i64::MAX as u64;

// ---------------------------------------------------------------------------
// Parameter labels
// ---------------------------------------------------------------------------

/// Node titles recognized as parameter inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLabel {
    ColorInputDetails,
    ColorInputBody,
    PromptTokenInput,
    GlobalSeed,
}

impl ParamLabel {
    pub const ALL: [ParamLabel; 4] = [
        ParamLabel::ColorInputDetails,
        ParamLabel::ColorInputBody,
        ParamLabel::PromptTokenInput,
        ParamLabel::GlobalSeed,
    ];

    /// The exact node title this label matches.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColorInputDetails => "ColorInputDetails",
            Self::ColorInputBody => "ColorInputBody",
            Self::PromptTokenInput => "PromptTokenInput",
            Self::GlobalSeed => "GlobalSeed",
        }
    }

    /// Exact, case-sensitive match against a node title.
    pub fn from_title(title: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == title)
    }
}

/// Values written into the titled parameter nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValues {
    pub color_details: String,
    pub color_body: String,
    pub prompt_token: String,
}

/// A parameter node that was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedParam {
    pub node_id: String,
    pub label: ParamLabel,
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// Draw a seed uniformly from `0..=MAX_SEED`.
pub fn draw_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.random_range(0..=MAX_SEED)
}

/// Replace every `seed` / `noise_seed` input with a fresh random value.
///
/// Only fields that already exist are replaced; nothing is added. Nodes
/// are visited in node-ID order and `seed` is drawn before `noise_seed`,
/// so a seeded `rng` gives reproducible output. Returns the number of
/// fields replaced.
pub fn randomize_seeds<R: Rng + ?Sized>(workflow: &mut Workflow, rng: &mut R) -> usize {
    let mut replaced = 0;
    for (_, node) in workflow.nodes_mut() {
        let Some(inputs) = node.inputs.as_mut() else {
            continue;
        };
        for field in SEED_INPUTS {
            if let Some(slot) = inputs.get_mut(field) {
                *slot = Value::from(draw_seed(rng));
                replaced += 1;
            }
        }
    }
    replaced
}

// ---------------------------------------------------------------------------
// Titled parameters
// ---------------------------------------------------------------------------

/// Set `inputs.value` on every node whose `_meta.title` is one of the
/// [`ParamLabel`]s. `GlobalSeed` receives a fresh random seed.
pub fn apply_params<R: Rng + ?Sized>(
    workflow: &mut Workflow,
    values: &ParamValues,
    rng: &mut R,
) -> Vec<AppliedParam> {
    set_titled_values(workflow, TitleSource::Meta, |label| {
        Some(match label {
            ParamLabel::ColorInputDetails => Value::from(values.color_details.as_str()),
            ParamLabel::ColorInputBody => Value::from(values.color_body.as_str()),
            ParamLabel::PromptTokenInput => Value::from(values.prompt_token.as_str()),
            ParamLabel::GlobalSeed => Value::from(draw_seed(&mut *rng)),
        })
    })
}

/// Legacy colour setter: matches the top-level `title` field and only
/// the two colour labels.
pub fn apply_colors(
    workflow: &mut Workflow,
    color_details: &str,
    color_body: &str,
) -> Vec<AppliedParam> {
    set_titled_values(workflow, TitleSource::Legacy, |label| match label {
        ParamLabel::ColorInputDetails => Some(Value::from(color_details)),
        ParamLabel::ColorInputBody => Some(Value::from(color_body)),
        _ => None,
    })
}

/// Legacy token setter: matches the top-level `title` field and only
/// `PromptTokenInput`.
pub fn apply_token(workflow: &mut Workflow, token: &str) -> Vec<AppliedParam> {
    set_titled_values(workflow, TitleSource::Legacy, |label| match label {
        ParamLabel::PromptTokenInput => Some(Value::from(token)),
        _ => None,
    })
}

fn set_titled_values<F>(
    workflow: &mut Workflow,
    source: TitleSource,
    mut value_for: F,
) -> Vec<AppliedParam>
where
    F: FnMut(ParamLabel) -> Option<Value>,
{
    let mut applied = Vec::new();
    for (node_id, node) in workflow.nodes_mut() {
        let Some(label) = node.title(source).and_then(ParamLabel::from_title) else {
            continue;
        };
        if let Some(value) = value_for(label) {
            node.set_input(VALUE_INPUT, value);
            applied.push(AppliedParam {
                node_id: node_id.to_string(),
                label,
            });
        }
    }
    applied
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    fn values() -> ParamValues {
        ParamValues {
            color_details: "5005441".into(),
            color_body: "12227444".into(),
            prompt_token: "Oarfish".into(),
        }
    }

    fn workflow(value: serde_json::Value) -> Workflow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn randomize_replaces_seed_fields_only() {
        let mut wf = workflow(json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20, "cfg": 7.5}},
            "5": {"class_type": "KSamplerAdvanced", "inputs": {"noise_seed": 1, "seed": 2}},
            "7": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0]}},
            "9": {"class_type": "Note"}
        }));
        let before = wf.clone();
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(randomize_seeds(&mut wf, &mut rng), 3);

        for (id, node) in wf.nodes() {
            let old = before.node(id).unwrap();
            let Some(inputs) = node.inputs.as_ref() else {
                assert_eq!(node, old);
                continue;
            };
            for (field, value) in inputs {
                if SEED_INPUTS.contains(&field.as_str()) {
                    let seed = value.as_u64().expect("seed must be a non-negative integer");
                    assert!(seed <= MAX_SEED);
                } else {
                    assert_eq!(Some(value), old.input(field));
                }
            }
            assert_eq!(inputs.len(), old.inputs.as_ref().unwrap().len());
        }
    }

    #[test]
    fn randomize_is_reproducible_with_seeded_rng() {
        let doc = json!({"3": {"inputs": {"seed": 0}}, "4": {"inputs": {"noise_seed": 0}}});
        let mut a = workflow(doc.clone());
        let mut b = workflow(doc);
        randomize_seeds(&mut a, &mut StdRng::seed_from_u64(99));
        randomize_seeds(&mut b, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn randomize_does_not_add_missing_seed_fields() {
        let mut wf = workflow(json!({"1": {"inputs": {"text": "hello"}}}));
        let before = wf.clone();
        assert_eq!(randomize_seeds(&mut wf, &mut StdRng::seed_from_u64(0)), 0);
        assert_eq!(wf, before);
    }

    #[test]
    fn apply_params_touches_only_labelled_nodes() {
        let mut wf = workflow(json!({
            "1": {"inputs": {"value": "old"}, "_meta": {"title": "ColorInputDetails"}},
            "2": {"inputs": {"value": "old"}, "_meta": {"title": "ColorInputBody"}},
            "3": {"inputs": {"value": "old"}, "_meta": {"title": "PromptTokenInput"}},
            "4": {"inputs": {"value": 0}, "_meta": {"title": "GlobalSeed"}},
            "5": {"inputs": {"value": "keep"}, "_meta": {"title": "colorinputdetails"}},
            "6": {"inputs": {"value": "keep"}, "_meta": {}},
            "7": {"inputs": {"value": "keep"}, "title": "ColorInputBody"},
            "8": {"inputs": {"seed": 5}, "_meta": {"title": "KSampler"}}
        }));
        let before = wf.clone();
        let mut rng = StdRng::seed_from_u64(3);

        let applied = apply_params(&mut wf, &values(), &mut rng);

        let ids: Vec<&str> = applied.iter().map(|p| p.node_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(wf.node("1").unwrap().input("value"), Some(&json!("5005441")));
        assert_eq!(wf.node("2").unwrap().input("value"), Some(&json!("12227444")));
        assert_eq!(wf.node("3").unwrap().input("value"), Some(&json!("Oarfish")));
        let global = wf.node("4").unwrap().input("value").unwrap().as_u64().unwrap();
        assert!(global <= MAX_SEED);

        for id in ["5", "6", "7", "8"] {
            assert_eq!(wf.node(id), before.node(id), "node {id} must be unchanged");
        }
    }

    #[test]
    fn apply_params_creates_inputs_on_matching_node() {
        let mut wf = workflow(json!({"1": {"_meta": {"title": "PromptTokenInput"}}}));
        apply_params(&mut wf, &values(), &mut StdRng::seed_from_u64(0));
        assert_eq!(wf.node("1").unwrap().input("value"), Some(&json!("Oarfish")));
    }

    #[test]
    fn apply_params_skips_non_string_titles() {
        let mut wf = workflow(json!({
            "1": {"inputs": {"value": "keep"}, "_meta": {"title": 42}},
            "2": {"inputs": {"value": "old"}, "_meta": {"title": "PromptTokenInput"}}
        }));

        let applied = apply_params(&mut wf, &values(), &mut StdRng::seed_from_u64(0));

        assert_eq!(applied.len(), 1);
        assert_eq!(wf.node("1").unwrap().input("value"), Some(&json!("keep")));
        assert_eq!(wf.node("2").unwrap().input("value"), Some(&json!("Oarfish")));
    }

    #[test]
    fn legacy_setters_match_top_level_title() {
        let mut wf = workflow(json!({
            "1": {"inputs": {"value": ""}, "title": "ColorInputDetails"},
            "2": {"inputs": {"value": ""}, "title": "ColorInputBody"},
            "3": {"inputs": {"value": ""}, "title": "PromptTokenInput"},
            "4": {"inputs": {"value": ""}, "_meta": {"title": "ColorInputBody"}}
        }));

        let colors = apply_colors(&mut wf, "red", "blue");
        assert_eq!(colors.len(), 2);
        assert_eq!(wf.node("1").unwrap().input("value"), Some(&json!("red")));
        assert_eq!(wf.node("2").unwrap().input("value"), Some(&json!("blue")));
        assert_eq!(wf.node("3").unwrap().input("value"), Some(&json!("")));
        assert_eq!(wf.node("4").unwrap().input("value"), Some(&json!("")));

        let tokens = apply_token(&mut wf, "Oarfish");
        assert_eq!(
            tokens,
            vec![AppliedParam {
                node_id: "3".into(),
                label: ParamLabel::PromptTokenInput
            }]
        );
        assert_eq!(wf.node("3").unwrap().input("value"), Some(&json!("Oarfish")));
    }

    #[test]
    fn label_matching_is_exact() {
        assert_eq!(ParamLabel::from_title("GlobalSeed"), Some(ParamLabel::GlobalSeed));
        assert_eq!(ParamLabel::from_title("GlobalSeed "), None);
        assert_eq!(ParamLabel::from_title(""), None);
    }
}
