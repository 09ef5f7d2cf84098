use signet_core::{DuplicateAction, DuplicatePolicy, IdentityId, ReferenceTemplate};
use std::io::{BufRead, Write};

/// Asks on the terminal whether an identical enrolled reference should be replaced.
///
/// Anything but `y`/`yes` keeps the existing reference, including EOF and read errors.
pub struct PromptPolicy<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptPolicy<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> DuplicatePolicy for PromptPolicy<R, W> {
    fn resolve(&mut self, identity: IdentityId, existing: &ReferenceTemplate) -> DuplicateAction {
        let asked = write!(
            self.output,
            "Identity {identity} already has this signature as reference {} (enrolled {}). Replace it? [y/N] ",
            existing.id,
            existing.enrolled_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
        .and_then(|_| self.output.flush());
        if let Err(err) = asked {
            tracing::warn!(error = %err, "could not write duplicate prompt; keeping existing reference");
            return DuplicateAction::Skip;
        }

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(_) if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") => {
                DuplicateAction::Replace
            }
            Ok(_) => DuplicateAction::Skip,
            Err(err) => {
                tracing::warn!(error = %err, "could not read answer; keeping existing reference");
                DuplicateAction::Skip
            }
        }
    }
}
