use std::{fs, io, path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use vmpdb_core::backend::PdbFileBackend;
use vmpdb_core::memory::SparseMemory;
use vmpdb_core::pe::image::map_image;
use vmpdb_core::pe::MappedPe;
use vmpdb_core::{
    Address, BootstrapMode, Capabilities, DisplayRequest, PdbError, PdbHandle, PdbResult, PdbSubsystem, ProcessId,
    TargetInfo,
};
use vmpdb_utils::{init_logging, ConfigStore, SymbolConfig};

const DEFAULT_BASE_64: u64 = 0xffff_f800_0000_0000;
const DEFAULT_BASE_32: u64 = 0x8040_0000;

/// Kernel symbol lookups and structure dumps against a Windows kernel image.
#[derive(Parser, Debug)]
#[command(name = "vmpdb")]
#[command(version)]
#[command(about = "Kernel symbol lookups and dt-style structure dumps from PDB files", long_about = None)]
struct Cli
{
    /// Kernel image (ntoskrnl.exe) whose PDB is used
    #[arg(short, long, global = true)]
    image: Option<PathBuf>,

    /// Address the image is mapped at (default depends on the image bitness)
    #[arg(long, global = true, value_parser = parse_address)]
    base: Option<Address>,

    /// Local symbol-store directory (overrides the stored configuration)
    #[arg(long, global = true)]
    symbols: Option<PathBuf>,

    /// Configuration file (default: <config dir>/vmpdb/symbols.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Display a kernel type, optionally with the values of an instance
    Dt
    {
        /// Type name, e.g. _EPROCESS
        type_name: String,
        /// Levels of nested structures to expand
        #[arg(short, long, default_value_t = 1)]
        depth: u8,
        /// Address of an instance to read values from
        #[arg(short, long, value_parser = parse_address)]
        address: Option<Address>,
        /// Append a hex/ASCII dump of the instance
        #[arg(long, default_value_t = false)]
        hex: bool,
        /// Treat the address as an object body and show its headers
        #[arg(long, default_value_t = false)]
        object_header: bool,
    },
    /// Resolve a kernel symbol to its offset and address
    Symbol
    {
        /// Symbol name (wildcards allowed)
        name: String,
    },
    /// Offset of a member inside a kernel type
    Offset
    {
        type_name: String,
        field: String,
    },
    /// Size of a kernel type
    Size
    {
        type_name: String,
    },
    /// Show or change the symbol configuration
    Config
    {
        /// Local symbol cache directory
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Symbol server URL
        #[arg(long)]
        server: Option<String>,
        /// Use the symbol server
        #[arg(long)]
        server_enable: Option<bool>,
        /// Enable debug symbol support
        #[arg(long)]
        enable: Option<bool>,
    },
}

/// Parse `0x`-prefixed or bare hex, accepting WinDbg style backticks.
fn parse_address(text: &str) -> Result<Address, String>
{
    let cleaned: String = text.chars().filter(|&ch| ch != '`' && ch != '_').collect();
    let digits = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")).unwrap_or(&cleaned);
    u64::from_str_radix(digits, 16).map(Address::new).map_err(|err| format!("invalid address {text}: {err}"))
}

fn main()
{
    let _log_guard = match init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn config_store(cli: &Cli) -> Option<ConfigStore>
{
    cli.config.clone().map(ConfigStore::new).or_else(ConfigStore::default_location)
}

fn run(cli: Cli) -> PdbResult<()>
{
    if let Commands::Config { cache, server, server_enable, enable } = &cli.command {
        return configure(&cli, cache.clone(), server.clone(), *server_enable, *enable);
    }

    let subsystem = open_kernel(&cli)?;
    let ctx = subsystem.context()?;
    if !ctx.is_enabled() {
        return Err(PdbError::Disabled);
    }

    match cli.command {
        Commands::Dt { type_name, depth, address, hex, object_header } => {
            let mut request = DisplayRequest::new(&type_name).depth(depth).hex_ascii(hex).object_header(object_header);
            if let Some(address) = address {
                request = request.at(address);
            }
            let dump = ctx.display_type(&request)?;
            print!("{}", dump.text);
        }
        Commands::Symbol { name } => {
            let offset = ctx.symbol_offset(PdbHandle::KERNEL, &name)?;
            let address = ctx.symbol_address(PdbHandle::KERNEL, &name)?;
            println!("{name} = {} (nt+0x{offset:x})", ctx.target().format_address(address));
        }
        Commands::Offset { type_name, field } => {
            let offset = ctx.type_child_offset(PdbHandle::KERNEL, &type_name, &field)?;
            println!("{type_name}.{field} = 0x{offset:x}");
        }
        Commands::Size { type_name } => {
            let size = ctx.type_size(PdbHandle::KERNEL, &type_name)?;
            println!("sizeof({type_name}) = 0x{size:x}");
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

fn configure(
    cli: &Cli,
    cache: Option<PathBuf>,
    server: Option<String>,
    server_enable: Option<bool>,
    enable: Option<bool>,
) -> PdbResult<()>
{
    let store = config_store(cli);
    let mut config = match &store {
        Some(store) => store.load()?,
        None => SymbolConfig::default(),
    };

    let changed = cache.is_some() || server.is_some() || server_enable.is_some() || enable.is_some();
    if let Some(cache) = cache {
        config.local_cache = Some(cache);
    }
    if let Some(server) = server {
        config.server_url = Some(server);
    }
    if let Some(server_enable) = server_enable {
        config.server_enable = server_enable;
    }
    if let Some(enable) = enable {
        config.enable = enable;
    }

    if changed {
        if let Some(store) = &store {
            store.save(&config)?;
            info!(path = %store.path().display(), "symbol configuration updated");
        }
    }

    println!("enable        : {}", config.enable);
    println!("server enable : {}", config.server_enable);
    println!("local cache   : {}", config.cache_dir().display());
    println!("server        : {}", config.server());
    println!("symbol path   : {}", config.symbol_path());
    Ok(())
}

/// Map the kernel image into a sparse address space and bootstrap the
/// subsystem against it on this thread.
fn open_kernel(cli: &Cli) -> PdbResult<PdbSubsystem>
{
    let path = cli
        .image
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no kernel image given (use --image)"))?;
    let file = fs::read(path)?;
    let image = map_image(&file)?;

    let default_base = if image.is_32bit { DEFAULT_BASE_32 } else { DEFAULT_BASE_64 };
    let base = cli.base.unwrap_or(Address::new(default_base));
    let size = u32::try_from(image.bytes.len()).map_err(|_| PdbError::Truncated(image.bytes.len() as u64))?;
    let target = if image.is_32bit { TargetInfo::new_32(base, size) } else { TargetInfo::new_64(base, size) };

    let memory = Arc::new(SparseMemory::new());
    memory.map(ProcessId::SYSTEM, base, image.bytes);
    let capabilities = Capabilities {
        backend: Arc::new(PdbFileBackend::new()),
        pe: Arc::new(MappedPe::new(memory.clone())),
        memory,
    };

    let mut config = match config_store(cli) {
        Some(store) => store.load()?,
        None => SymbolConfig::default(),
    };
    if let Some(symbols) = &cli.symbols {
        config.local_cache = Some(symbols.clone());
    }
    config.enable = true;

    debug!(image = %path.display(), base = %base, is_32bit = image.is_32bit, "mapped kernel image");
    let subsystem = PdbSubsystem::new(capabilities, target, config).mode(BootstrapMode::Sync);
    subsystem.initialize()?;
    Ok(subsystem)
}
