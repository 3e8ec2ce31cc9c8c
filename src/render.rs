//! Rendering collaborator.

use crate::prediction::PredictionResult;

/// Receives every decoded result. `None` means nothing to show yet.
pub trait Render: Send + Sync + 'static {
    fn render(&self, result: Option<&PredictionResult>);
}

/// Display lines for a result, in the order the camera overlay lists them.
pub fn describe(result: Option<&PredictionResult>) -> Vec<String> {
    match result {
        None => Vec::new(),
        Some(PredictionResult::Rejected { error }) => vec![format!("No prediction: {error}")],
        Some(PredictionResult::Classified(p)) => {
            let mut lines = Vec::with_capacity(p.class_indices.len() + 2);
            lines.push(format!("Prediction: {}", p.label));
            lines.push("Probabilities:".to_string());
            lines.extend(
                p.entries()
                    .map(|(_, name, prob)| format!("{name}: {prob:.4}")),
            );
            lines
        }
    }
}

/// Writes each result to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleRenderer;

impl Render for ConsoleRenderer {
    fn render(&self, result: Option<&PredictionResult>) {
        for line in describe(result) {
            println!("{line}");
        }
    }
}
