use console::style;
use databot_core::{StartupReport, ToolRegistry};

pub fn print_report(report: &StartupReport, registry: &ToolRegistry) {
    println!();
    for provider in &report.connected {
        println!(
            "  {} {} ({} tool(s))",
            style("✓").green(),
            style(&provider.name).cyan().bold(),
            provider.tools.len()
        );
    }
    for failure in &report.failed {
        println!(
            "  {} {}: {:#}",
            style("✗").red(),
            style(&failure.provider).cyan().bold(),
            failure.reason
        );
    }

    let descriptors = registry.descriptors();
    if descriptors.is_empty() {
        println!();
        println!("  {}", style("No tools available.").dim());
        println!();
        return;
    }

    println!();
    for tool in descriptors {
        println!("  {}", style(&tool.name).white().bold());
        if !tool.description.is_empty() {
            println!("      {}", style(tool.description.trim()).dim());
        }
    }
    println!();
}
