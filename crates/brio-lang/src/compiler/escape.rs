use rustc_hash::FxHashSet;
use smol_str::SmolStr;

/// Variables whose current value is known to be escaped already.
///
/// Paths are stored dotted (`user.name`). Marking a variable unsafe also drops
/// every path below it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetyTracker {
    safe: FxHashSet<SmolStr>,
}

impl SafetyTracker {
    pub fn is_safe(&self, path: &str) -> bool {
        if self.safe.contains(path) {
            return true;
        }
        path.char_indices()
            .filter(|(_, c)| *c == '.')
            .any(|(i, _)| self.safe.contains(&path[..i]))
    }

    pub fn mark_safe(&mut self, path: &str) {
        self.safe.insert(SmolStr::new(path));
    }

    pub fn mark_unsafe(&mut self, path: &str) {
        self.safe
            .retain(|p| p != path && !(p.starts_with(path) && p[path.len()..].starts_with('.')));
    }

    /// Keeps only what is safe on every path through a branch.
    pub fn merge(&mut self, outcomes: &[SafetyTracker]) {
        self.safe.retain(|path| outcomes.iter().all(|o| o.is_safe(path)));
        let common = outcomes
            .first()
            .map(|first| {
                first
                    .safe
                    .iter()
                    .filter(|path| outcomes.iter().all(|o| o.is_safe(path)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        self.safe.extend(common);
    }
}
