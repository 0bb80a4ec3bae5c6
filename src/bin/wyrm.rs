use std::io::Read;

use clap::{Parser, Subcommand};
use wyrm::{Compartment, FeatureSpec, Linker, Value};

#[derive(Parser)]
#[command(name = "wyrm", about = "WebAssembly virtual machine")]
struct Cli {
    /// Enable every feature extension (threads, simd, exceptions, ...).
    #[arg(long, global = true)]
    all_features: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Instantiate a module and invoke an exported function.
    Run {
        /// Path to a .wasm or .wat file. Reads from stdin if omitted.
        file: Option<String>,
        /// Exported function to invoke after instantiation.
        #[arg(long)]
        invoke: Option<String>,
        /// Arguments for the invoked function, matched against its
        /// signature.
        args: Vec<String>,
    },
    /// Disassemble a module to the text format.
    Print {
        /// Path to a .wasm or .wat file. Reads from stdin if omitted.
        file: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let features = if cli.all_features {
        FeatureSpec::all()
    } else {
        FeatureSpec::default()
    };
    match cli.command {
        Command::Run { file, invoke, args } => run(file, invoke, args, features),
        Command::Print { file } => print(file, features),
    }
}

fn run(
    file: Option<String>,
    invoke: Option<String>,
    args: Vec<String>,
    features: FeatureSpec,
) -> anyhow::Result<()> {
    let bytes = read_input(file)?;
    let module = wyrm::decode_and_validate(&bytes, features)?;

    let compartment = Compartment::new();
    let linker = Linker::new();
    let instance = wyrm::instantiate(&compartment, &module, &linker)?;

    let Some(name) = invoke else {
        return Ok(());
    };
    let function = instance
        .get_function(&name)
        .ok_or_else(|| anyhow::anyhow!("no exported function {name:?}"))?;
    let params = function.ty().params();
    anyhow::ensure!(
        params.len() == args.len(),
        "{name} takes {} argument(s), got {}",
        params.len(),
        args.len()
    );
    let args: Vec<Value> = params
        .iter()
        .zip(&args)
        .map(|(&ty, text)| parse_value(ty, text))
        .collect::<anyhow::Result<_>>()?;

    let results = function.invoke(&args)?;
    for value in results {
        println!("{value}");
    }
    Ok(())
}

fn print(file: Option<String>, features: FeatureSpec) -> anyhow::Result<()> {
    let bytes = read_input(file)?;
    let module = wyrm::decode_module(&bytes, features)?;
    print!("{}", wyrm::print_module(&module));
    Ok(())
}

fn parse_value(ty: wyrm::types::ValueType, text: &str) -> anyhow::Result<Value> {
    use wyrm::types::ValueType;
    Ok(match ty {
        ValueType::I32 => Value::I32(text.parse()?),
        ValueType::I64 => Value::I64(text.parse()?),
        ValueType::F32 => Value::F32(text.parse()?),
        ValueType::F64 => Value::F64(text.parse()?),
        ValueType::V128 => Value::V128(text.parse()?),
        ValueType::Any => anyhow::bail!("unexpected parameter type"),
    })
}

/// Accepts binary or text input; text is assembled to binary.
fn read_input(file: Option<String>) -> anyhow::Result<Vec<u8>> {
    let raw = match file {
        Some(path) => std::fs::read(&path)?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    Ok(wat::parse_bytes(&raw)?.into_owned())
}
