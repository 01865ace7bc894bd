use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use crate::command::Context;
use crate::config::Config;

pub fn init(path: &Path) -> Result<()> {
    Config::init(path).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✓ Created {}", style(path.display()).bold());
    println!();
    println!("{}:", style("Next steps").bold());
    println!("  1. Set middleware.api_key (or export MW_API_KEY)");
    println!("  2. Point agent.path at the Java agent JAR on this host");
    println!("  3. Run: java-injector list --discovered");
    Ok(())
}

pub fn show(ctx: &Context) -> Result<()> {
    match &ctx.location {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# no config file found; showing defaults"),
    }
    print!("{}", ctx.config.effective_yaml()?);
    Ok(())
}
