//! 标签协议解析器
//!
//! 从模型输出中提取 `<tool_call name="X" params='{...}'>描述</tool_call>`。
//! 处理顺序：HTML 实体反转义 -> 按规则表归一化已知的标签拼写怪癖 -> 规划优先策略 -> 正则匹配。
//! 单步执行约束：遇到第一个 execute_command 即停止，后续标签一律不再评估，
//! 返回结果只含该调用；respond / delegate 只在没有 execute_command 时返回。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::react::invocation::ToolInvocation;

/// 标签拼写归一化规则表：(模式, 替换)；按顺序应用
const TAG_QUIRK_RULES: &[(&str, &str)] = &[
    // `<TOOL_ CALL` / `</tool_  call`：模型偶尔在 TOOL_ 与 CALL 之间插入空白
    (r"(?i)<(/?)\s*tool_\s+call\b", "<${1}tool_call"),
    // 大小写统一为小写
    (r"(?i)<(/?)\s*tool_call\b", "<${1}tool_call"),
];

/// 规划标记：首轮中与工具标签同时出现时延迟执行，先把计划展示给用户
const PLANNING_MARKERS: &[&str] = &["[PLANNING]"];

static QUIRK_REGEXES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    TAG_QUIRK_RULES
        .iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, *replacement)))
        .collect()
});

/// 开始标签探测（用于诊断：探测到但未完整匹配的标签）
static OPEN_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)<tool_call\b").ok());

/// 完整调用：name 属性、单引号包裹的 params JSON、描述、闭合标签（闭合标签名内允许空白）
static TOOL_CALL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<tool_call\s+name\s*=\s*"([^"]*)"\s+params\s*=\s*'(.*?)'\s*>(.*?)</\s*tool_call\s*>"#,
    )
    .ok()
});

/// 解析器接口：匹配策略（正则 / 分词器）可替换而不影响调用方
pub trait ToolCallParser: Send + Sync {
    fn parse(&self, text: &str, is_first_turn: bool) -> Vec<ToolInvocation>;

    fn stats(&self) -> ParserStatsSnapshot {
        ParserStatsSnapshot::default()
    }
}

/// 解析器健康指标（原子计数）
#[derive(Debug, Default)]
pub struct ParserStats {
    parsed: AtomicU64,
    decode_failures: AtomicU64,
    unmatched_tags: AtomicU64,
    deferred_plans: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParserStatsSnapshot {
    pub parsed: u64,
    pub decode_failures: u64,
    pub unmatched_tags: u64,
    pub deferred_plans: u64,
}

impl ParserStats {
    pub fn snapshot(&self) -> ParserStatsSnapshot {
        ParserStatsSnapshot {
            parsed: self.parsed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unmatched_tags: self.unmatched_tags.load(Ordering::Relaxed),
            deferred_plans: self.deferred_plans.load(Ordering::Relaxed),
        }
    }
}

/// HTML 实体反转义（模型有时会转义尖括号）；命名实体与十进制 / 十六进制数字实体都会解码
pub fn unescape_html(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

/// 按规则表归一化标签拼写；流式阶段对每个 chunk 也会调用
pub fn normalize_tag_quirks(text: &str) -> String {
    QUIRK_REGEXES
        .iter()
        .fold(text.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// 基于正则的标签解析器
#[derive(Debug, Default)]
pub struct TagParser {
    stats: ParserStats,
}

impl TagParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_defer(&self, text: &str, is_first_turn: bool) -> bool {
        is_first_turn && PLANNING_MARKERS.iter().any(|m| text.contains(m))
    }
}

impl ToolCallParser for TagParser {
    fn parse(&self, text: &str, is_first_turn: bool) -> Vec<ToolInvocation> {
        let (Some(open_tag), Some(tool_call)) = (OPEN_TAG.as_ref(), TOOL_CALL.as_ref()) else {
            return Vec::new();
        };

        let normalized = normalize_tag_quirks(&unescape_html(text));
        let detected = open_tag.find_iter(&normalized).count();
        if detected == 0 {
            return Vec::new();
        }

        if self.should_defer(&normalized, is_first_turn) {
            self.stats.deferred_plans.fetch_add(1, Ordering::Relaxed);
            tracing::info!(tags = detected, "planning section on first turn, deferring tool execution");
            return Vec::new();
        }

        let matched = tool_call.find_iter(&normalized).count();
        if matched < detected {
            self.stats
                .unmatched_tags
                .fetch_add((detected - matched) as u64, Ordering::Relaxed);
            tracing::warn!(detected, matched, "tool_call tag detected but not matched by the protocol grammar");
        }

        let mut invocations = Vec::new();
        let mut seen = HashSet::new();
        for caps in tool_call.captures_iter(&normalized) {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            let raw_params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let description = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");

            let parameters = match serde_json::from_str::<Value>(raw_params) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(tool = %name, kind = %json_kind(&other), "params is not a JSON object, skipping");
                    continue;
                }
                Err(e) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(tool = %name, error = %e, "failed to decode params JSON, skipping");
                    continue;
                }
            };

            let invocation = ToolInvocation::new(name, parameters, description);
            if invocation.is_execution() {
                // 出现 execute_command 时结果只含这一个调用，之前收集的控制类工具一并丢弃
                invocations.clear();
                invocations.push(invocation);
                break;
            }
            // 非执行类工具：仅在整段文本没有 execute_command 时生效，每种只保留首次出现
            if seen.insert(name.to_lowercase()) {
                invocations.push(invocation);
            }
        }

        self.stats
            .parsed
            .fetch_add(invocations.len() as u64, Ordering::Relaxed);
        invocations
    }

    fn stats(&self) -> ParserStatsSnapshot {
        self.stats.snapshot()
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::invocation::ToolKind;

    const LS: &str = r#"<tool_call name="execute_command" params='{"command":"ls -la"}'>List files</tool_call>"#;

    fn parse(text: &str) -> Vec<ToolInvocation> {
        TagParser::new().parse(text, false)
    }

    #[test]
    fn test_basic_invocation() {
        let out = parse(&format!("Let me look.\n{}", LS));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "execute_command");
        assert_eq!(out[0].parameters["command"], "ls -la");
        assert_eq!(out[0].description, "List files");
    }

    #[test]
    fn test_only_first_execute_command_survives() {
        let text = r#"
<tool_call name="execute_command" params='{"command":"whoami"}'>first</tool_call>
<tool_call name="execute_command" params='{"command":"id"}'>second</tool_call>
<tool_call name="execute_command" params='{"command":"uname"}'>third</tool_call>"#;
        let out = parse(text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parameters["command"], "whoami");
    }

    #[test]
    fn test_case_and_space_tolerance() {
        let variants = [
            r#"<TOOL_CALL name="execute_command" params='{"command":"ls"}'>d</TOOL_CALL>"#,
            r#"<tool_call name="execute_command" params='{"command":"ls"}'>d</tool_call>"#,
            r#"<Tool_Call name="execute_command" params='{"command":"ls"}'>d</Tool_Call>"#,
            r#"<TOOL_ CALL name="execute_command" params='{"command":"ls"}'>d</TOOL_ CALL>"#,
        ];
        let expected = parse(variants[1]);
        assert_eq!(expected.len(), 1);
        for v in variants {
            assert_eq!(parse(v), expected, "variant: {}", v);
        }
    }

    #[test]
    fn test_plan_first_deferral() {
        let text = format!("[PLANNING]\n1. list files\n2. summarize\n{}", LS);
        let parser = TagParser::new();
        assert!(parser.parse(&text, true).is_empty());
        assert_eq!(parser.stats().deferred_plans, 1);
        assert_eq!(parser.parse(&text, false).len(), 1);
    }

    #[test]
    fn test_planning_without_tag_is_not_deferred_metric() {
        let parser = TagParser::new();
        assert!(parser.parse("[PLANNING]\njust a plan", true).is_empty());
        assert_eq!(parser.stats().deferred_plans, 0);
    }

    #[test]
    fn test_html_escaped_input() {
        let text = r#"&lt;tool_call name=&quot;execute_command&quot; params=&#39;{&quot;command&quot;:&quot;pwd&quot;}&#39;&gt;where&lt;/tool_call&gt;"#;
        let out = parse(text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parameters["command"], "pwd");
    }

    #[test]
    fn test_bad_json_is_skipped_and_next_match_considered() {
        let text = r#"
<tool_call name="execute_command" params='{"command": oops}'>broken</tool_call>
<tool_call name="execute_command" params='{"command":"date"}'>ok</tool_call>"#;
        let parser = TagParser::new();
        let out = parser.parse(text, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parameters["command"], "date");
        assert_eq!(parser.stats().decode_failures, 1);
    }

    #[test]
    fn test_non_object_params_rejected() {
        let out = parse(r#"<tool_call name="respond" params='[1,2]'>x</tool_call>"#);
        assert!(out.is_empty());
    }

    #[test]
    fn test_control_tools_first_occurrence_only() {
        let text = r#"
<tool_call name="delegate" params='{"task":"a"}'>one</tool_call>
<tool_call name="respond" params='{"text":"hi"}'>r1</tool_call>
<tool_call name="respond" params='{"text":"again"}'>r2</tool_call>"#;
        let out = parse(text);
        let kinds: Vec<ToolKind> = out.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, vec![ToolKind::Delegate, ToolKind::Respond]);
        assert_eq!(out[1].parameters["text"], "hi");
    }

    #[test]
    fn test_numeric_entities_decoded() {
        let dec = r#"&#60;tool_call name="execute_command" params='{"command":"pwd"}'&#62;where&#60;/tool_call&#62;"#;
        let hex = r#"&#x3C;tool_call name=&#x22;execute_command&#x22; params='{"command":"pwd"}'&#x3E;where&#x3C;/tool_call&#x3E;"#;
        for text in [dec, hex] {
            let out = parse(text);
            assert_eq!(out.len(), 1, "input: {}", text);
            assert_eq!(out[0].parameters["command"], "pwd");
        }
        assert_eq!(unescape_html("a &amp;&amp; b &gt; c"), "a && b > c");
    }

    #[test]
    fn test_control_tools_before_execute_are_dropped() {
        let text = r#"
<tool_call name="respond" params='{"text":"checking","break_loop":false}'>progress</tool_call>
<tool_call name="delegate" params='{"task":"audit","reason":"later"}'>sub</tool_call>
<tool_call name="execute_command" params='{"command":"whoami"}'>first</tool_call>
<tool_call name="execute_command" params='{"command":"id"}'>second</tool_call>"#;
        let parser = TagParser::new();
        let out = parser.parse(text, false);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_execution());
        assert_eq!(out[0].parameters["command"], "whoami");
        assert_eq!(parser.stats().parsed, 1);
    }

    #[test]
    fn test_execute_stops_parsing() {
        let text = format!(
            "{}\n{}",
            LS, r#"<tool_call name="respond" params='{"text":"done"}'>r</tool_call>"#
        );
        let out = parse(&text);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_execution());
    }

    #[test]
    fn test_unknown_tool_is_returned_for_caller_to_skip() {
        let out = parse(r#"<tool_call name="browse" params='{"url":"x"}'>b</tool_call>"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), ToolKind::Unknown);
    }

    #[test]
    fn test_unmatched_tag_counted() {
        let parser = TagParser::new();
        let out = parser.parse(r#"<tool_call name="execute_command">no params</tool_call>"#, false);
        assert!(out.is_empty());
        assert_eq!(parser.stats().unmatched_tags, 1);
    }

    #[test]
    fn test_single_quote_inside_json_string() {
        let out = parse(r#"<tool_call name="execute_command" params='{"command":"echo 'hi'"}'>say</tool_call>"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parameters["command"], "echo 'hi'");
    }

    #[test]
    fn test_normalize_quirks() {
        assert_eq!(normalize_tag_quirks("<TOOL_  CALL x></Tool_ Call>"), "<tool_call x></tool_call>");
        assert_eq!(normalize_tag_quirks("plain text"), "plain text");
    }
}
