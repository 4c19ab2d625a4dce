//! Rendering of plan steps into the commands a shell based engine runs.

use std::time::Duration;

use crate::{Container, Step};

/// The command line that carries out `step`, or `None` for steps that only
/// change container configuration (mounts, env, user, ...).
pub fn argv(step: &Step) -> Option<Vec<String>> {
    match step {
        Step::Exec { args } => Some(args.clone()),
        Step::RemovePaths { paths } => {
            let mut args = vec!["rm".to_string(), "-rf".to_string()];
            args.extend(paths.iter().cloned());
            Some(args)
        }
        Step::WaitForFile { path, wait } => Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            wait_script(path, wait.interval, wait.deadline),
        ]),
        Step::CopyFile { from, to } => Some(vec!["cp".to_string(), from.clone(), to.clone()]),
        Step::Substitute {
            path,
            pattern,
            replacement,
        } => Some(vec![
            "sed".to_string(),
            "-i".to_string(),
            "-E".to_string(),
            format!("s|{}|{}|g", pattern, replacement),
            path.clone(),
        ]),
        _ => None,
    }
}

/// Every command a container plan runs, in order.
pub fn commands(container: &Container) -> Vec<Vec<String>> {
    container.steps().iter().filter_map(argv).collect()
}

/// Joins `args` into a single line a POSIX shell parses back into the same
/// words.
pub fn shell_line(args: &[String]) -> String {
    args.iter()
        .map(|a| quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes one word for a POSIX shell.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn seconds(d: Duration) -> String {
    format!("{}", d.as_secs_f64())
}

fn wait_script(path: &str, interval: Duration, deadline: Option<Duration>) -> String {
    let sleep = seconds(interval);
    match deadline {
        None => format!(
            r#"while [ ! -f "{path}" ]; do echo "{path} not ready, waiting.." && sleep {sleep}; done"#,
            path = path,
            sleep = sleep
        ),
        Some(deadline) => {
            let attempts = attempts(interval, deadline);
            format!(
                r#"i=0; while [ ! -f "{path}" ]; do if [ "$i" -ge {attempts} ]; then echo "timed out waiting for {path}" >&2; exit 1; fi; i=$((i+1)); echo "{path} not ready, waiting.." && sleep {sleep}; done"#,
                path = path,
                attempts = attempts,
                sleep = sleep
            )
        }
    }
}

// Number of sleeps that fit in the deadline, rounded up so a deadline shorter
// than one interval still checks once more after sleeping.
fn attempts(interval: Duration, deadline: Duration) -> u128 {
    let interval = interval.as_millis().max(1);
    (deadline.as_millis() + interval - 1) / interval
}
