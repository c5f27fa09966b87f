//! Label matcher.

/// Whether a runner declaring `runner_labels` can serve a job requiring `runs_on`.
///
/// A job without requirements matches any runner. Otherwise one shared label is
/// enough.
pub fn matches(runner_labels: &[String], runs_on: &[String]) -> bool {
    runs_on.is_empty() || runs_on.iter().any(|label| runner_labels.contains(label))
}

/// Narrow the runner's labels by a caller-supplied filter.
///
/// An empty filter leaves the runner's labels untouched.
pub fn narrow(runner_labels: &[String], filter: &[String]) -> Vec<String> {
    if filter.is_empty() {
        return runner_labels.to_vec();
    }
    runner_labels
        .iter()
        .filter(|label| filter.contains(label))
        .cloned()
        .collect()
}

/// Trim, drop empties and deduplicate while keeping declaration order.
pub fn normalize<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = label.as_ref().trim();
        if !label.is_empty() && !out.iter().any(|l| l == label) {
            out.push(label.to_string());
        }
    }
    out
}
