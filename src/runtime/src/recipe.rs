//! Recipe parser.
//!
//! A recipe is a Dockerfile-compatible list of provisioning instructions.
//! Supports line continuations (`\`), comments, quoted words, and both
//! shell and JSON (exec) forms for RUN/CMD/ENTRYPOINT.

use std::path::Path;
use std::time::Duration;

use strata_core::error::{ProvisionError, Result};
use strata_core::{Command, EnvironmentBinding, Step};

/// A single recipe instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image>`
    From { image: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// `COPY` or `RUN`
    Step(Step),
    /// `ENV <key>=<value>` or `ENV <key> <value>`
    Env(EnvironmentBinding),
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: String },
}

/// Parsed recipe: instructions in declaration order.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    /// Parse a recipe from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();
        let mut from_line: Option<usize> = None;

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let parsed = parse_instruction(trimmed, line_num)?;
            for instruction in parsed {
                match &instruction {
                    Instruction::From { .. } => {
                        if let Some(first) = from_line {
                            return Err(recipe_error(
                                line_num,
                                format!(
                                    "multi-stage recipes are not supported (first FROM on line {})",
                                    first
                                ),
                            ));
                        }
                        from_line = Some(line_num);
                    }
                    Instruction::Arg { .. } => {}
                    _ if from_line.is_none() => {
                        return Err(recipe_error(
                            line_num,
                            "first instruction must be FROM (or ARG before FROM)",
                        ));
                    }
                    _ => {}
                }
                instructions.push(instruction);
            }
        }

        if from_line.is_none() {
            return Err(recipe_error(0, "recipe has no FROM instruction"));
        }

        Ok(Recipe { instructions })
    }

    /// Parse a recipe from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!(
                "failed to read recipe at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// The FROM image, before ARG expansion.
    pub fn base(&self) -> &str {
        self.instructions
            .iter()
            .find_map(|i| match i {
                Instruction::From { image } => Some(image.as_str()),
                _ => None,
            })
            .unwrap_or(strata_core::image::SCRATCH)
    }

    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.instructions.iter().filter_map(|i| match i {
            Instruction::Step(step) => Some(step),
            _ => None,
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }
}

fn recipe_error(line: usize, message: impl Into<String>) -> ProvisionError {
    ProvisionError::Recipe {
        line,
        message: message.into(),
    }
}

/// Join lines ending with `\` into logical lines, keeping the line number
/// where each logical line starts.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        } else if line.trim_start().starts_with('#') {
            // Comments inside a continuation are dropped
            continue;
        }

        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line into instructions.
///
/// ENV and LABEL may declare several pairs on one line; each becomes its own
/// instruction, applied in order.
fn parse_instruction(line: &str, line_num: usize) -> Result<Vec<Instruction>> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    let single = |i: Result<Instruction>| i.map(|i| vec![i]);

    match keyword_upper.as_str() {
        "FROM" => single(parse_from(rest, line_num)),
        "ARG" => single(parse_arg(rest, line_num)),
        "COPY" => single(parse_copy(rest, line_num)),
        "RUN" => single(parse_run(rest, line_num)),
        "ENV" => parse_env(rest, line_num),
        "WORKDIR" => single(parse_workdir(rest, line_num)),
        "LABEL" => parse_label(rest, line_num),
        "CMD" => single(parse_exec_form(rest, line_num, "CMD").map(|exec| Instruction::Cmd { exec })),
        "ENTRYPOINT" => single(
            parse_exec_form(rest, line_num, "ENTRYPOINT").map(|exec| Instruction::Entrypoint { exec }),
        ),
        "EXPOSE" => parse_expose(rest, line_num),
        "ADD" => Err(recipe_error(
            line_num,
            "ADD is not supported; use COPY for files from the build context",
        )),
        "USER" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => {
            tracing::warn!(
                line = line_num,
                instruction = keyword_upper.as_str(),
                "Unsupported recipe instruction, skipping"
            );
            Ok(Vec::new())
        }
        _ => Err(recipe_error(
            line_num,
            format!("unknown instruction '{}'", keyword),
        )),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Peel leading `--name=value` flags off an instruction's arguments.
fn split_flags(rest: &str) -> (Vec<(&str, &str)>, &str) {
    let mut flags = Vec::new();
    let mut remaining = rest.trim_start();
    while remaining.starts_with("--") {
        let (word, after) = split_first_word(remaining);
        let body = &word[2..];
        let (name, value) = body.split_once('=').unwrap_or((body, ""));
        flags.push((name, value));
        remaining = after;
    }
    (flags, remaining)
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "FROM requires an image argument"));
    }

    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() > 1 {
        if parts[1].eq_ignore_ascii_case("AS") {
            return Err(recipe_error(
                line_num,
                "multi-stage recipes are not supported (FROM ... AS)",
            ));
        }
        return Err(recipe_error(line_num, "FROM takes a single image argument"));
    }

    Ok(Instruction::From {
        image: parts[0].to_string(),
    })
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "ARG requires a name"));
    }

    let (name, default) = match rest.split_once('=') {
        Some((name, value)) => (name.trim(), Some(unquote(value))),
        None => (rest.trim(), None),
    };
    if !strata_core::env::is_valid_name(name) {
        return Err(recipe_error(line_num, format!("invalid ARG name '{}'", name)));
    }

    Ok(Instruction::Arg {
        name: name.to_string(),
        default,
    })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "COPY requires source and destination"));
    }

    let (flags, remaining) = split_flags(rest);
    let mut mode = None;
    for (name, value) in flags {
        match name {
            "chmod" => {
                mode = Some(u32::from_str_radix(value, 8).map_err(|_| {
                    recipe_error(line_num, format!("invalid --chmod value '{}'", value))
                })?);
            }
            "from" => {
                return Err(recipe_error(
                    line_num,
                    "COPY --from is not supported (multi-stage recipes)",
                ));
            }
            "chown" => {
                tracing::warn!(line = line_num, "COPY --chown is ignored");
            }
            other => {
                return Err(recipe_error(
                    line_num,
                    format!("unsupported COPY flag '--{}'", other),
                ));
            }
        }
    }

    let parts = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        split_words(remaining)
    };
    if parts.len() != 2 {
        return Err(recipe_error(
            line_num,
            "COPY requires exactly one source and a destination",
        ));
    }

    Ok(Instruction::Step(Step::CopyFile {
        source: parts[0].clone(),
        destination: parts[1].clone(),
        mode,
    }))
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    let (flags, remaining) = split_flags(rest);
    if remaining.is_empty() {
        return Err(recipe_error(line_num, "RUN requires a command"));
    }

    let mut verify = Vec::new();
    let mut timeout = None;
    for (name, value) in flags {
        match name {
            "verify" if !value.is_empty() => verify.push(value.to_string()),
            "timeout" => {
                timeout = Some(parse_duration(value).ok_or_else(|| {
                    recipe_error(line_num, format!("invalid --timeout value '{}'", value))
                })?);
            }
            other => {
                return Err(recipe_error(
                    line_num,
                    format!("unsupported RUN flag '--{}'", other),
                ));
            }
        }
    }

    let command = if remaining.starts_with('[') {
        let argv = parse_json_array(remaining, line_num)?;
        if argv.is_empty() {
            return Err(recipe_error(line_num, "RUN exec form requires a program"));
        }
        Command::Exec(argv)
    } else {
        Command::Shell(remaining.to_string())
    };

    Ok(Instruction::Step(Step::RunCommand {
        command,
        verify,
        timeout,
    }))
}

fn parse_env(rest: &str, line_num: usize) -> Result<Vec<Instruction>> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "ENV requires a key and value"));
    }

    let (first, after) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: ENV KEY VALUE (value is the rest of the line)
        if !strata_core::env::is_valid_name(first) {
            return Err(recipe_error(line_num, format!("invalid ENV name '{}'", first)));
        }
        if after.trim().is_empty() {
            return Err(recipe_error(
                line_num,
                format!("ENV {} has no value (use ENV {}=\"\" for an empty one)", first, first),
            ));
        }
        return Ok(vec![Instruction::Env(EnvironmentBinding::new(
            first,
            unquote(after),
        ))]);
    }

    parse_pairs(rest, line_num, "ENV")?
        .into_iter()
        .map(|(key, value)| {
            if strata_core::env::is_valid_name(&key) {
                Ok(Instruction::Env(EnvironmentBinding::new(key, value)))
            } else {
                Err(recipe_error(line_num, format!("invalid ENV name '{}'", key)))
            }
        })
        .collect()
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "WORKDIR requires a path"));
    }
    Ok(Instruction::Workdir {
        path: unquote(rest),
    })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Vec<Instruction>> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "LABEL requires key=value"));
    }

    if !rest.contains('=') {
        // LABEL key value (legacy)
        let (key, value) = split_first_word(rest);
        return Ok(vec![Instruction::Label {
            key: key.to_string(),
            value: unquote(value),
        }]);
    }

    Ok(parse_pairs(rest, line_num, "LABEL")?
        .into_iter()
        .map(|(key, value)| Instruction::Label { key, value })
        .collect())
}

fn parse_exec_form(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, format!("{} requires an argument", keyword)));
    }

    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        // Shell form: wrap in sh -c
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Vec<Instruction>> {
    if rest.is_empty() {
        return Err(recipe_error(line_num, "EXPOSE requires a port"));
    }
    Ok(rest
        .split_whitespace()
        .map(|port| Instruction::Expose {
            port: port.to_string(),
        })
        .collect())
}

// --- Helpers ---

/// Parse `k=v k2="v 2"` into pairs.
fn parse_pairs(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<(String, String)>> {
    split_words(rest)
        .into_iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    recipe_error(
                        line_num,
                        format!("{} expects key=value pairs, got '{}'", keyword, word),
                    )
                })
        })
        .collect()
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        recipe_error(line_num, format!("invalid JSON array '{}': {}", s, e))
    })
}

/// Parse `600`, `600s`, `10m` or `1h`.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, mult) = match s.char_indices().last()? {
        (idx, 's') => (&s[..idx], 1),
        (idx, 'm') => (&s[..idx], 60),
        (idx, 'h') => (&s[..idx], 3600),
        _ => (s, 1),
    };
    let secs: u64 = num.parse().ok()?;
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs.checked_mul(mult)?))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Whitespace split that honours quotes.
///
/// Quotes are removed. Inside single quotes `$` is escaped so it is not
/// expanded later; `\"` and `\\` unescape, while `\$` is kept for expansion.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('\''), '$') => current.push_str("\\$"),
            (Some('\''), c) => current.push(c),
            (_, '\\') => match chars.peek().copied() {
                Some(next @ ('"' | '\\' | ' ')) => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push('\\'),
            },
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (_, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(instruction: &Instruction) -> &Step {
        match instruction {
            Instruction::Step(step) => step,
            other => panic!("expected step, got {:?}", other),
        }
    }

    // --- join_continuation_lines ---

    #[test]
    fn test_join_continuation_simple() {
        let input = "RUN apt-get update && \\\n    apt-get install -y curl";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 1);
        assert!(lines[0].1.contains("apt-get update"));
        assert!(lines[0].1.contains("apt-get install"));
    }

    #[test]
    fn test_join_continuation_keeps_start_line() {
        let input = "FROM ubuntu:18.04\n\nRUN a \\\n    b \\\n    c\nRUN d";
        let lines = join_continuation_lines(input);
        let numbers: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 6]);
    }

    #[test]
    fn test_join_continuation_skips_inner_comments() {
        let input = "RUN apt-get install -y \\\n# the compiler\n    llvm-6.0";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1.contains("llvm-6.0"));
        assert!(!lines[0].1.contains("compiler"));
    }

    // --- FROM / ARG ---

    #[test]
    fn test_parse_from_simple() {
        assert_eq!(
            parse_from("ubuntu:18.04", 1).unwrap(),
            Instruction::From {
                image: "ubuntu:18.04".to_string()
            }
        );
    }

    #[test]
    fn test_parse_from_alias_rejected() {
        assert!(parse_from("golang:1.21 AS builder", 1).is_err());
        assert!(parse_from("", 1).is_err());
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(
            parse_arg("VERSION=\"1.0.0\"", 1).unwrap(),
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: Some("1.0.0".to_string()),
            }
        );
        assert_eq!(
            parse_arg("VERSION", 1).unwrap(),
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: None,
            }
        );
        assert!(parse_arg("1BAD=x", 1).is_err());
    }

    // --- COPY ---

    #[test]
    fn test_parse_copy_simple() {
        let i = parse_copy("install/ubuntu_install_core.sh /install/ubuntu_install_core.sh", 1)
            .unwrap();
        assert_eq!(
            step(&i),
            &Step::copy(
                "install/ubuntu_install_core.sh",
                "/install/ubuntu_install_core.sh"
            )
        );
    }

    #[test]
    fn test_parse_copy_chmod() {
        let i = parse_copy("--chmod=755 a.sh /usr/local/bin/a", 1).unwrap();
        assert_eq!(
            step(&i),
            &Step::CopyFile {
                source: "a.sh".to_string(),
                destination: "/usr/local/bin/a".to_string(),
                mode: Some(0o755),
            }
        );
        assert!(parse_copy("--chmod=rwx a /b", 1).is_err());
    }

    #[test]
    fn test_parse_copy_json_form() {
        let i = parse_copy(r#"["my file.txt", "/opt/my file.txt"]"#, 1).unwrap();
        assert_eq!(step(&i), &Step::copy("my file.txt", "/opt/my file.txt"));
    }

    #[test]
    fn test_parse_copy_rejects_bad_shapes() {
        assert!(parse_copy("", 1).is_err());
        assert!(parse_copy("onlysource", 1).is_err());
        assert!(parse_copy("a b /dest/", 1).is_err());
        assert!(parse_copy("--from=builder /app /app", 1).is_err());
        assert!(parse_copy("--link a /b", 1).is_err());
    }

    // --- RUN ---

    #[test]
    fn test_parse_run_shell() {
        let i = parse_run("apt-get update --fix-missing", 1).unwrap();
        assert_eq!(step(&i), &Step::run("apt-get update --fix-missing"));
    }

    #[test]
    fn test_parse_run_exec() {
        let i = parse_run(r#"["bash", "/install/install_tvm_cpu.sh"]"#, 1).unwrap();
        assert_eq!(
            step(&i),
            &Step::exec(["bash", "/install/install_tvm_cpu.sh"])
        );
    }

    #[test]
    fn test_parse_run_flags() {
        let i = parse_run(
            "--verify=/usr/tvm/build/libtvm.so --timeout=2h bash /install/install_tvm_cpu.sh",
            1,
        )
        .unwrap();
        assert_eq!(
            step(&i),
            &Step::RunCommand {
                command: Command::Shell("bash /install/install_tvm_cpu.sh".to_string()),
                verify: vec!["/usr/tvm/build/libtvm.so".to_string()],
                timeout: Some(Duration::from_secs(7200)),
            }
        );
    }

    #[test]
    fn test_parse_run_rejects() {
        assert!(parse_run("", 1).is_err());
        assert!(parse_run("--timeout=10s", 1).is_err());
        assert!(parse_run("--timeout=soon make", 1).is_err());
        assert!(parse_run("--mount=type=cache make", 1).is_err());
        assert!(parse_run("[]", 1).is_err());
    }

    // --- ENV ---

    #[test]
    fn test_parse_env_equals() {
        let parsed = parse_env("PYTHONPATH=/usr/tvm/python:${PYTHONPATH}", 1).unwrap();
        assert_eq!(
            parsed,
            vec![Instruction::Env(EnvironmentBinding::new(
                "PYTHONPATH",
                "/usr/tvm/python:${PYTHONPATH}"
            ))]
        );
    }

    #[test]
    fn test_parse_env_multiple_pairs() {
        let parsed = parse_env(r#"LANG=C.UTF-8 MSG="hello world""#, 1).unwrap();
        assert_eq!(
            parsed,
            vec![
                Instruction::Env(EnvironmentBinding::new("LANG", "C.UTF-8")),
                Instruction::Env(EnvironmentBinding::new("MSG", "hello world")),
            ]
        );
    }

    #[test]
    fn test_parse_env_single_quotes_are_literal() {
        let parsed = parse_env("PS1='$ '", 1).unwrap();
        assert_eq!(
            parsed,
            vec![Instruction::Env(EnvironmentBinding::new("PS1", "\\$ "))]
        );
    }

    #[test]
    fn test_parse_env_legacy() {
        let parsed = parse_env("MY_VAR my value", 1).unwrap();
        assert_eq!(
            parsed,
            vec![Instruction::Env(EnvironmentBinding::new("MY_VAR", "my value"))]
        );
    }

    #[test]
    fn test_parse_env_rejects() {
        assert!(parse_env("", 1).is_err());
        assert!(parse_env("A=1 B", 1).is_err());
        assert!(parse_env("BAD-NAME=1", 1).is_err());
    }

    // --- metadata ---

    #[test]
    fn test_parse_cmd_and_entrypoint() {
        assert_eq!(
            parse_exec_form(r#"["jupyter", "notebook"]"#, 1, "CMD").unwrap(),
            vec!["jupyter", "notebook"]
        );
        assert_eq!(
            parse_exec_form("echo hello", 1, "CMD").unwrap(),
            vec!["/bin/sh", "-c", "echo hello"]
        );
        assert!(parse_exec_form("", 1, "ENTRYPOINT").is_err());
    }

    #[test]
    fn test_parse_label_and_expose() {
        assert_eq!(
            parse_label(r#"version="1.0" maintainer=ml-team"#, 1).unwrap(),
            vec![
                Instruction::Label {
                    key: "version".to_string(),
                    value: "1.0".to_string()
                },
                Instruction::Label {
                    key: "maintainer".to_string(),
                    value: "ml-team".to_string()
                },
            ]
        );
        assert_eq!(parse_expose("8888 6006/tcp", 1).unwrap().len(), 2);
    }

    // --- helpers ---

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("600"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("9999999999999999h"), None);
        assert_eq!(
            parse_duration("5124095576030431h"),
            Some(Duration::from_secs(5124095576030431 * 3600))
        );
    }

    #[test]
    fn test_parse_run_timeout_overflow_is_error() {
        let err = Recipe::parse("FROM scratch\nRUN --timeout=9999999999999999h true\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_env_legacy_without_value() {
        let err = Recipe::parse("FROM scratch\nENV TVM_HOME\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(err.to_string().contains("TVM_HOME"));
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words(r#"a "b c" d"#), vec!["a", "b c", "d"]);
        assert_eq!(split_words(r#"K="x \"y\"""#), vec![r#"K=x "y""#]);
        assert_eq!(split_words(r"P=\$HOME"), vec![r"P=\$HOME"]);
        assert_eq!(split_words(r#"E="""#), vec!["E="]);
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(r#""hello world""#), "hello world");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote(r#""hello'"#), r#""hello'"#);
        assert_eq!(unquote("\""), "\"");
    }

    // --- full recipes ---

    #[test]
    fn test_parse_demo_recipe() {
        let content = r#"
# Minimum image to run the compiler demo
FROM ubuntu:18.04

RUN apt-get update --fix-missing

COPY install/ubuntu_install_core.sh /install/ubuntu_install_core.sh
RUN bash /install/ubuntu_install_core.sh

COPY install/install_tvm_cpu.sh /install/install_tvm_cpu.sh
RUN --verify=/usr/tvm/build/libtvm.so bash /install/install_tvm_cpu.sh

ENV PYTHONPATH=/usr/tvm/python:/usr/tvm/vta/python:${PYTHONPATH}
ENV PATH=/usr/local/nvidia/bin:${PATH}
ENV PATH=/usr/local/cuda/bin:${PATH}

WORKDIR /workspace
CMD ["jupyter", "notebook", "--ip=0.0.0.0"]
"#;
        let recipe = Recipe::parse(content).unwrap();
        assert_eq!(recipe.base(), "ubuntu:18.04");
        assert_eq!(recipe.step_count(), 5);
        assert_eq!(recipe.instructions.len(), 11);
    }

    #[test]
    fn test_parse_arg_before_from() {
        let recipe = Recipe::parse("ARG BASE=ubuntu:18.04\nFROM ${BASE}\nRUN true").unwrap();
        assert!(matches!(&recipe.instructions[0], Instruction::Arg { .. }));
        assert_eq!(recipe.base(), "${BASE}");
    }

    #[test]
    fn test_parse_requires_from_first() {
        let err = Recipe::parse("RUN echo hello\nFROM ubuntu").unwrap_err();
        assert!(matches!(err, ProvisionError::Recipe { line: 1, .. }));
    }

    #[test]
    fn test_parse_empty_recipe() {
        assert!(Recipe::parse("# just a comment\n\n").is_err());
    }

    #[test]
    fn test_parse_second_from_rejected() {
        let err = Recipe::parse("FROM a\nRUN true\nFROM b").unwrap_err();
        assert!(matches!(err, ProvisionError::Recipe { line: 3, .. }));
    }

    #[test]
    fn test_parse_unknown_instruction_reports_line() {
        let err = Recipe::parse("FROM a\n\nFROBNICATE x").unwrap_err();
        assert!(matches!(err, ProvisionError::Recipe { line: 3, .. }));
        let err = Recipe::parse("FROM a\nADD x /x").unwrap_err();
        assert!(err.to_string().contains("ADD"));
    }

    #[test]
    fn test_parse_skips_unsupported_instructions() {
        let recipe = Recipe::parse("FROM a\nUSER nobody\nVOLUME /data\nRUN true").unwrap();
        assert_eq!(recipe.instructions.len(), 2);
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let recipe = Recipe::parse("from a\nrun true\ncopy x /x").unwrap();
        assert_eq!(recipe.step_count(), 2);
    }
}
