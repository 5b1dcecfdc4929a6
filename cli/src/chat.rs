use anyhow::Result;
use databot_core::{AgentLoop, StartupReport};
use std::io::{self, BufRead, Write};

pub async fn run(agent: &AgentLoop, report: &StartupReport, message: Option<String>) -> Result<()> {
    if let Some(msg) = message {
        println!("\n🤔 Processing...\n");
        return match agent.process(&msg).await {
            Ok(response) => {
                println!("{}", response);
                Ok(())
            }
            Err(e) => {
                eprintln!("❌ Error: {}", e);
                anyhow::bail!("Agent processing failed: {}", e);
            }
        };
    }

    println!("📊 databot");
    println!(
        "{} tool(s) from {} server(s). Type your question (Ctrl+D to exit):\n",
        report.tool_count(),
        report.connected.len()
    );

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        match stdin.lock().read_line(&mut input) {
            Ok(0) | Err(_) => {
                println!("\n👋 Goodbye!");
                break;
            }
            Ok(_) => {
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }

                println!("\n🤔 Processing...\n");
                match agent.process(input).await {
                    Ok(response) => println!("{}", response),
                    Err(e) => eprintln!("❌ Error: {}", e),
                }
                println!();
            }
        }
    }

    Ok(())
}
