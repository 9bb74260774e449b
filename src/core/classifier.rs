//! 命令错误分类器
//!
//! 把失败命令的 error / stderr 文本映射为「可修复（附重试建议）」或「致命」。
//! 规则表按顺序线性扫描，首个命中的规则生效；未命中且非致命时默认可修复，
//! 让模型再试一次（循环上限由编排器的 max_iterations 兜底）。

use crate::core::{CommandFailure, ErrorClassification};

/// 致命模式：命中即返回 None（不再建议重试）
const CRITICAL_PATTERNS: &[&str] = &[
    "out of memory",
    "cannot allocate memory",
    "oom-killer",
    "oom killer",
    "memoryerror",
    "killed process",
];

/// 单条分类规则：任一关键词命中即生效；模板占位符 {error} / {cmd_name} / {command}
struct ClassificationRule {
    keywords: &'static [&'static str],
    message: &'static str,
    suggestion: &'static str,
}

const RULES: &[ClassificationRule] = &[
    ClassificationRule {
        keywords: &["permission denied", "operation not permitted", "access denied"],
        message: "Permission denied while running `{cmd_name}`: {error}",
        suggestion: "Retry with elevated privileges (e.g. prefix with sudo) or adjust the file permissions before running `{command}` again.",
    },
    ClassificationRule {
        keywords: &["command not found", "not recognized as", "executable file not found"],
        message: "`{cmd_name}` is not installed or not on PATH: {error}",
        suggestion: "Install `{cmd_name}` first, or use an alternative tool that is already available.",
    },
    ClassificationRule {
        keywords: &["no such file or directory", "cannot access", "file not found", "does not exist"],
        message: "File or directory not found: {error}",
        suggestion: "Verify the path exists (e.g. with ls or find) and correct it before retrying `{cmd_name}`.",
    },
    ClassificationRule {
        keywords: &[
            "connection refused",
            "could not resolve host",
            "name or service not known",
            "network is unreachable",
            "connection reset",
            "connection timed out",
        ],
        message: "Network connection failed for `{cmd_name}`: {error}",
        suggestion: "Check that the host and port are correct and the service is running, then retry.",
    },
    ClassificationRule {
        // 排在网络规则之后，"connection timed out" 归为网络问题
        keywords: &["timed out", "timeout"],
        message: "`{cmd_name}` timed out: {error}",
        suggestion: "Run a lighter variant of the command, limit its scope, or run it in the background.",
    },
    ClassificationRule {
        keywords: &["syntax error", "unexpected token", "invalid option", "unrecognized option", "usage:"],
        message: "Invalid syntax or arguments for `{cmd_name}`: {error}",
        suggestion: "Check the usage of `{cmd_name}` (e.g. `{cmd_name} --help`) and fix the arguments in `{command}`.",
    },
    ClassificationRule {
        keywords: &["not a directory", "is a directory", "too many levels of symbolic links"],
        message: "Path problem while running `{cmd_name}`: {error}",
        suggestion: "Check whether the path refers to a file or a directory and adjust `{command}` accordingly.",
    },
    ClassificationRule {
        keywords: &["no space left on device", "disk quota exceeded"],
        message: "Disk space exhausted: {error}",
        suggestion: "Free up disk space (e.g. remove temporary files, check with df -h) before retrying.",
    },
];

const DEFAULT_SUGGESTION: &str = "Try an alternative approach.";

/// 错误分类器：无状态，规则表为编译期常量
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 分类一次失败；命中致命模式时返回 None
    pub fn classify(&self, command: &str, error: &str, stderr: &str) -> Option<ErrorClassification> {
        let haystack = format!("{}\n{}", error, stderr).to_lowercase();
        if CRITICAL_PATTERNS.iter().any(|p| haystack.contains(p)) {
            return None;
        }

        let raw_error = primary_error_text(error, stderr);
        let cmd_name = command.split_whitespace().next().unwrap_or("");

        let classification = RULES
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| haystack.contains(k)))
            .map(|rule| ErrorClassification {
                repairable: true,
                message: fill_template(rule.message, raw_error, cmd_name, command),
                suggestion: Some(fill_template(rule.suggestion, raw_error, cmd_name, command)),
            })
            .unwrap_or_else(|| ErrorClassification {
                repairable: true,
                message: format!("Command `{}` failed: {}", cmd_name, raw_error),
                suggestion: Some(DEFAULT_SUGGESTION.to_string()),
            });
        Some(classification)
    }

    /// classify 的标签化版本：None 映射为 Critical
    pub fn assess(&self, command: &str, error: &str, stderr: &str) -> CommandFailure {
        match self.classify(command, error, stderr) {
            Some(c) => CommandFailure::Repairable(c),
            None => CommandFailure::Critical {
                message: format!(
                    "Critical failure while running `{}`: {}",
                    command.trim(),
                    primary_error_text(error, stderr)
                ),
            },
        }
    }
}

/// error 为空时退回 stderr
fn primary_error_text<'a>(error: &'a str, stderr: &'a str) -> &'a str {
    let error = error.trim();
    if error.is_empty() {
        stderr.trim()
    } else {
        error
    }
}

fn fill_template(template: &str, error: &str, cmd_name: &str, command: &str) -> String {
    template
        .replace("{error}", error)
        .replace("{cmd_name}", cmd_name)
        .replace("{command}", command.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_repairable() {
        let c = ErrorClassifier::new()
            .classify("rm x", "Permission denied", "")
            .expect("repairable");
        assert!(c.repairable);
        assert!(c.message.contains("`rm`"));
        assert!(c.suggestion.unwrap().contains("elevated privileges"));
    }

    #[test]
    fn test_out_of_memory_is_critical() {
        let classifier = ErrorClassifier::new();
        assert!(classifier.classify("x", "Out of memory", "").is_none());
        assert!(classifier.classify("make", "", "fatal: Cannot allocate memory").is_none());
        assert!(!classifier.assess("x", "Out of memory", "").is_repairable());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        // 同时含 "permission denied" 与 "no such file"：权限规则排在前面
        let c = ErrorClassifier::new()
            .classify("cat a", "permission denied; no such file or directory", "")
            .unwrap();
        assert!(c.message.starts_with("Permission denied"));
    }

    #[test]
    fn test_stderr_only_match_and_template() {
        let c = ErrorClassifier::new()
            .classify("ls /nope", "", "ls: cannot access '/nope': No such file or directory")
            .unwrap();
        assert!(c.message.contains("cannot access '/nope'"));
        assert!(c.suggestion.unwrap().contains("`ls`"));
    }

    #[test]
    fn test_command_not_found_before_missing_file() {
        let c = ErrorClassifier::new()
            .classify("foo --bar", "sh: 1: foo: command not found", "")
            .unwrap();
        assert!(c.message.contains("not installed"));
        assert!(c.suggestion.unwrap().contains("Install `foo`"));
    }

    #[test]
    fn test_unmatched_defaults_to_repairable() {
        let c = ErrorClassifier::new()
            .classify("weird", "something odd happened", "")
            .unwrap();
        assert!(c.repairable);
        assert_eq!(c.suggestion.as_deref(), Some("Try an alternative approach."));
    }

    #[test]
    fn test_disk_full() {
        let failure = ErrorClassifier::new().assess("cp a b", "No space left on device", "");
        assert!(failure.is_repairable());
        assert!(failure.message().contains("Disk space"));
        assert!(failure.suggestion().unwrap().contains("df -h"));
    }

    #[test]
    fn test_connection_timeout_is_network_not_timeout() {
        let classifier = ErrorClassifier::new();
        let net = classifier
            .classify("curl http://db:5432", "curl: (7) Connection timed out", "")
            .unwrap();
        assert!(net.message.starts_with("Network connection failed"));

        let slow = classifier
            .classify("find / -name x", "Command timed out after 30s", "")
            .unwrap();
        assert!(slow.message.contains("timed out"));
        assert!(slow.suggestion.unwrap().contains("lighter variant"));
    }
}
