//! docquery 命令行
//!
//! `docquery [--config PATH] [QUESTION...]`：带问题时执行一次并打印回答、管道与耗时；
//! 不带问题时进入逐行交互，最近几轮问答作为上下文带入下一次提问。

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use docquery::agent::build_runtime;
use docquery::config::load_config;
use docquery::core::{AgentResponse, QueryRequest};
use docquery::memory::{ConversationMemory, ConversationTurn};
use tokio::io::{AsyncBufReadExt, BufReader};

fn parse_args() -> anyhow::Result<(Option<PathBuf>, String)> {
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            let path = args.next().context("--config requires a path")?;
            config_path = Some(PathBuf::from(path));
        } else {
            words.push(arg);
        }
    }
    Ok((config_path, words.join(" ")))
}

fn print_response(response: &AgentResponse) {
    if response.success {
        println!("\n{}\n", response.answer.as_deref().unwrap_or_default());
        if let Some(pipeline) = &response.pipeline {
            println!("Pipeline:\n{}", pipeline.to_pretty_json());
        }
        println!(
            "Results: {}  Query time: {:.2}s",
            response.result_count.unwrap_or(0),
            response.execution_time_seconds.unwrap_or(0.0)
        );
    } else {
        println!("\nError: {}", response.error.as_deref().unwrap_or("unknown error"));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docquery::observability::init();

    let (config_path, question) = parse_args()?;
    let cfg = load_config(config_path).context("Failed to load config")?;
    let runtime = build_runtime(&cfg).await.context("Failed to build agent")?;

    if !question.trim().is_empty() {
        let request = QueryRequest::new(question, runtime.default_tier)?;
        let response = runtime.runner.run(request).await;
        print_response(&response);
        if !response.success {
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut memory = ConversationMemory::new(cfg.agent.history_turns);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("docquery ({}): ask a question, 'clear' resets history, 'exit' quits", runtime.model_name);
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                memory.clear();
                println!("History cleared.");
                continue;
            }
            _ => {}
        }
        let request = match QueryRequest::new(line, runtime.default_tier) {
            Ok(r) => r.with_history(memory.turns()),
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let response = runtime.runner.run(request).await;
        print_response(&response);
        if let Some(answer) = &response.answer {
            memory.push(ConversationTurn::new(line, answer.clone()));
        }
    }
    Ok(())
}
