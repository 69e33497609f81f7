//! Project initialization: `marshal init`.

use anyhow::Result;

use marshal::marshal_config::MarshalConfig;

pub fn cmd_init(config: &MarshalConfig) -> Result<()> {
    use marshal::init::init_project;

    let result = init_project(&config.project_dir, &config.project_name())?;

    println!();
    if result.created {
        println!("Initialized marshal project at {}", result.marshal_dir.display());
    } else {
        println!("Project already initialized at {}", result.marshal_dir.display());
    }
    for file in &result.written {
        println!("  created {}", file.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Edit .marshal/milestones.json to describe your milestones");
    println!("  2. Adjust checkers and evidence in .marshal/marshal.toml");
    println!("  3. Run 'marshal run'");
    println!();
    Ok(())
}
