use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use rime::{CodeGenerator, Lexer, Parser as AsmParser, VirtualMachine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "A typed stack virtual machine and assembler")]
struct Cli {
    /// Assembly source file to assemble and run
    file: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rime=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let source = fs::read_to_string(&cli.file)
        .with_context(|| format!("Failed to read file: {}", cli.file))?;

    let mut lexer = Lexer::new(&source);
    let tokens = lexer.tokenize().context("Lexer error")?;

    let mut parser = AsmParser::new(tokens);
    let program = parser.parse().context("Parse error")?;

    let mut generator = CodeGenerator::new(&program);
    let bytecode = generator.generate().context("Assembly error")?;

    let mut vm = VirtualMachine::new(bytecode).context("Invalid bytecode")?;
    vm.run().context("Runtime error")?;

    Ok(())
}
