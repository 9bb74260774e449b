//! toolrun - 智能体工具执行运行时
//!
//! 模块划分：
//! - **agent**: 按配置装配编排器与协作方
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行时错误、轮次状态、会话监管
//! - **llm**: 分块流式 LLM 客户端抽象与实现（Ollama 风格 / OpenAI 兼容 / Mock）
//! - **memory**: 循环内对话上下文与持久化
//! - **observability**: 日志初始化
//! - **react**: 标签协议解析、控制工具、轮次编排
//! - **tools**: 命令执行协作方、执行阶段与审批握手

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{create_agent_components, AgentComponents};
pub use react::{TurnMessage, TurnMessageType, TurnOrchestrator};
