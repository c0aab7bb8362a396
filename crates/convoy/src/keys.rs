//! Canonical coordinator keyspace layout.
//!
//! One joining rule everywhere: segments are separated by exactly one
//! `/`, whether or not the operator's configured prefixes carry a
//! trailing slash. Task prefixes always end with `/` so the completer
//! and marker keys nest under them directly.

/// Join a prefix and a suffix with exactly one separator.
pub fn join(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if prefix.is_empty() {
        suffix.to_string()
    } else {
        format!("{prefix}/{suffix}")
    }
}

/// Key the operator publishes the server pools document under.
pub fn pools_key(config_prefix: &str) -> String {
    join(config_prefix, "pools")
}

/// Key the operator publishes the release document under.
pub fn release_key(config_prefix: &str) -> String {
    join(config_prefix, "release")
}

/// Prefix of one barrier's keyspace:
/// `<ws>/tasks/<axis>/<version>/<phase>/`.
pub fn task_prefix(workspace_prefix: &str, axis: &str, version: &str, phase: &str) -> String {
    let mut key = join(workspace_prefix, "tasks");
    key = join(&key, axis);
    key = join(&key, version);
    key = join(&key, phase);
    key.push('/');
    key
}

/// Prefix holding one key per host that finished the task.
pub fn completers_prefix(task_prefix: &str) -> String {
    format!("{task_prefix}completers/")
}

/// The task's terminal marker key.
pub fn complete_key(task_prefix: &str) -> String {
    format!("{task_prefix}complete")
}
