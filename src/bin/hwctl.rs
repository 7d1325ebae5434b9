use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use elixys_hal::{build_schema, Codec, CommandTable, HalError, HalResult, SystemConfig, Value};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let matches = App::new("hwctl")
        .version("0.1.0")
        .about("🔧 Inspect the Elixys hardware layout and build command frames")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Device description (JSON); defaults to $ELIXYS_HAL_CONFIG or the bundled layout")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("layout")
                .about("📐 Print the status frame layout")
                .long_about("Lists every status field with its byte offset, format code and C type")
                .arg(
                    Arg::with_name("json")
                        .long("json")
                        .help("Emit the layout as JSON for header generators"),
                ),
        )
        .subcommand(
            SubCommand::with_name("commands")
                .about("📋 List every declared command"),
        )
        .subcommand(
            SubCommand::with_name("encode")
                .about("🧱 Encode a command frame as hex")
                .arg(Arg::with_name("subsystem").required(true).help("Subsystem name, e.g. Valves"))
                .arg(Arg::with_name("command").required(true).help("Command name, e.g. set_state0"))
                .arg(
                    Arg::with_name("device")
                        .short("d")
                        .long("device")
                        .value_name("N")
                        .help("Unit to address")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("params")
                        .multiple(true)
                        .help("Parameter values (decimal, 0x-hex or float)"),
                ),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> HalResult<()> {
    let config = SystemConfig::resolve(matches.value_of("config"))?;
    let schema = build_schema(&config)?;

    match matches.subcommand() {
        ("layout", Some(sub)) if sub.is_present("json") => {
            println!("{}", serde_json::to_string_pretty(&Codec::new(schema).layout())?);
        }
        ("layout", Some(_)) => print_layout(&Codec::new(schema)),
        ("commands", Some(_)) => print_commands(&CommandTable::new(&schema)),
        ("encode", Some(sub)) => encode(&CommandTable::new(&schema), sub)?,
        _ => {}
    }
    Ok(())
}

fn print_layout(codec: &Codec) {
    println!("{}", "📐 Status frame layout".bright_blue().bold());
    println!(
        "{} {}  {} {}",
        "Format:".bright_white(),
        codec.format_string(),
        "Size:".bright_white(),
        format!("{} bytes", codec.frame_len()).bright_green()
    );
    println!();
    println!(
        "{:>6}  {:<24} {:>4}  {:<24} {:<6} {}",
        "offset".dimmed(),
        "subsystem".dimmed(),
        "unit".dimmed(),
        "field".dimmed(),
        "code".dimmed(),
        "c type".dimmed()
    );
    for field in codec.layout() {
        let unit = field.unit.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6}  {:<24} {:>4}  {:<24} {:<6} {}",
            field.offset,
            field.subsystem.bright_cyan(),
            unit,
            field.name,
            field.code.code(),
            field.c_type.dimmed()
        );
    }
}

fn print_commands(table: &CommandTable) {
    println!("{}", "📋 Commands".bright_blue().bold());
    for cmd in table.iter() {
        let format: String = cmd.param_format().iter().map(|c| c.code()).collect();
        println!(
            "{:>4}  {}.{}  {}",
            cmd.numeric_id().to_string().bright_green(),
            cmd.subsystem().bright_cyan(),
            cmd.name(),
            format!("<ii{}", format).dimmed()
        );
    }
}

fn encode(table: &CommandTable, matches: &ArgMatches) -> HalResult<()> {
    let subsystem = matches.value_of("subsystem").unwrap_or_default();
    let name = matches.value_of("command").unwrap_or_default();
    let mut cmd = table.lookup(subsystem, name)?;

    if let Some(device) = matches.value_of("device") {
        let device = device
            .parse::<i64>()
            .map_err(|_| HalError::Value(format!("device must be an integer, got {}", device)))?;
        cmd = cmd.for_device(device)?;
    }

    let params: Vec<Value> = matches
        .values_of("params")
        .map(|values| values.map(parse_param).collect())
        .unwrap_or_default();
    if !params.is_empty() {
        cmd = cmd.with_params(params)?;
    }

    let hex: String = cmd.to_bytes().iter().map(|b| format!("{:02x}", b)).collect();
    println!("{} {}", cmd.to_string().bright_cyan(), hex.bright_green());
    Ok(())
}

fn parse_param(text: &str) -> Value {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if let Ok(v) = i64::from_str_radix(hex, 16) {
            return Value::I64(v);
        }
    }
    if let Ok(v) = text.parse::<i64>() {
        return Value::I64(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return Value::F64(v);
    }
    Value::Bytes(text.as_bytes().to_vec())
}
