use anyhow::Result;
use std::path::Path;

pub async fn run(config_path: &Path, verbose: bool) -> Result<()> {
    println!("Checking {}...", config_path.display());
    let config = super::load(config_path, verbose).await?;

    println!("✓ Configuration valid");
    println!("  App: {}", config.app_name);
    println!("  Coordination: {}", config.coordination.addrs.join(", "));

    match &config.register {
        Some(descriptor) => println!(
            "  Registers: {} (weight {}, ttl {}s)",
            descriptor.key(),
            descriptor.weight,
            descriptor.ttl
        ),
        None => println!("  Registers: nothing"),
    }

    println!("  Domains: {}", config.domains.len());
    for (name, domain) in &config.domains {
        println!(
            "    {} -> {}{}",
            name,
            domain.key_prefix(),
            if domain.load_balance { " (balanced)" } else { "" }
        );
    }

    Ok(())
}
