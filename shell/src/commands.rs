//! # Shell Commands
//!
//! The command table and every built-in. Each command takes its argument
//! vector and returns a [`Result`]; the executor prints failures as
//! `"<cmd>: <message> (<hex code>)"` and records the exit status for
//! `$?`-style chaining.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use cinder_kernel::console::{console_getchar, console_write, console_writeln};
use cinder_kernel::error::{Error, Result};
use cinder_kernel::process;
use cinder_kernel::ticks::TICKS_PER_SEC;
use cinder_kernel::uri::{resolve_uri, Uri};
use cinder_image::{fetch_uri, find_image, images, BootPlan, Image};
use cinder_net::netdev::{self, NetDevice};
use cinder_net::{ipv4, ipv6};
use cinder_proto::dhcp::DhcpSession;
use cinder_san::device::san_devices;
use cinder_san::{san_hook, san_unhook};
use cinder_settings::types::{find_setting, SettingType};
use cinder_settings::{root_settings, tag, Setting};

use crate::parse::{expand, split_chain, tokenize, Connector};

/// A registered command
#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub exec: fn(&[String]) -> Result<()>,
}

static COMMANDS: RwLock<Vec<Command>> = RwLock::new(Vec::new());
static LAST_STATUS: Mutex<u32> = Mutex::new(0);
static SELECTED_IMAGE: Mutex<Option<String>> = Mutex::new(None);

/// Hook the platform installs to commit a boot plan and jump
pub type BootHandler = fn(&BootPlan) -> Result<()>;

static BOOT_HANDLER: Mutex<Option<BootHandler>> = Mutex::new(None);

/// Install the platform's transfer-of-control hook
pub fn set_boot_handler(handler: BootHandler) {
    *BOOT_HANDLER.lock() = Some(handler);
}

/// Register a command
pub fn register_command(command: Command) {
    let mut commands = COMMANDS.write();
    if commands.iter().any(|c| c.name == command.name) {
        return;
    }
    commands.push(command);
}

/// Status of the most recent command (`$?`)
pub fn last_status() -> u32 {
    *LAST_STATUS.lock()
}

/// Execute one full line (expansion, chaining); returns the final status
pub fn execute_line(line: &str) -> u32 {
    let expanded = expand(line);
    let mut status = 0u32;
    for (connector, segment) in split_chain(&expanded) {
        match connector {
            Connector::Always => {}
            Connector::OnSuccess if status != 0 => continue,
            Connector::OnFailure if status == 0 => continue,
            _ => {}
        }
        status = execute_segment(&segment);
    }
    status
}

fn execute_segment(segment: &str) -> u32 {
    let tokens = tokenize(segment);
    let Some(name) = tokens.first() else {
        return 0;
    };
    let command = COMMANDS
        .read()
        .iter()
        .find(|c| c.name == name.as_str())
        .copied();
    let status = match command {
        Some(command) => match (command.exec)(&tokens[1..]) {
            Ok(()) => 0,
            Err(err) => {
                console_writeln(&format!("{}: {}", command.name, err));
                err.exit_code()
            }
        },
        None => {
            console_writeln(&format!("{name}: command not found"));
            Error::NoSuchEntity.exit_code()
        }
    };
    *LAST_STATUS.lock() = status;
    status
}

// ============================================================================
// Helpers
// ============================================================================

/// Devices named by an argument, or every registered device
fn named_devices(args: &[String]) -> Result<Vec<Arc<NetDevice>>> {
    if args.is_empty() {
        let all = netdev::net_devices();
        if all.is_empty() {
            return Err(Error::NoSuchEntity);
        }
        return Ok(all);
    }
    args.iter()
        .map(|name| netdev::find_netdev(name).ok_or(Error::NoSuchEntity))
        .collect()
}

fn parse_uri_arg(args: &[String]) -> Result<Uri> {
    let text = args.first().ok_or(Error::InvalidArgument)?;
    let uri = Uri::parse(text);
    // Relative references resolve against the most recent fetch
    if uri.is_absolute() {
        return Ok(uri);
    }
    let base = images()
        .last()
        .and_then(|image| image.uri.clone());
    Ok(resolve_uri(base.as_ref(), &uri))
}

/// Run a plan through the platform hook
fn run_plan(plan: &BootPlan) -> Result<()> {
    // Script images execute inline and produce an empty plan
    if plan.entry == 0 && plan.segments.is_empty() {
        return Ok(());
    }
    match *BOOT_HANDLER.lock() {
        Some(handler) => handler(plan),
        None => {
            log::warn!("no boot handler installed");
            Err(Error::NotSupported)
        }
    }
}

fn exec_image(image: &Arc<Image>) -> Result<()> {
    let plan = image.exec()?;
    run_plan(&plan)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_echo(args: &[String]) -> Result<()> {
    console_writeln(&args.join(" "));
    Ok(())
}

fn cmd_ifopen(args: &[String]) -> Result<()> {
    for dev in named_devices(args)? {
        dev.open()?;
    }
    Ok(())
}

fn cmd_ifclose(args: &[String]) -> Result<()> {
    for dev in named_devices(args)? {
        dev.close();
    }
    Ok(())
}

fn cmd_dhcp(args: &[String]) -> Result<()> {
    let mut last = Err(Error::NoSuchEntity);
    for dev in named_devices(args)? {
        dev.open()?;
        last = DhcpSession::configure(&dev);
        if last.is_ok() {
            return Ok(());
        }
    }
    last
}

fn cmd_route(_args: &[String]) -> Result<()> {
    for route in ipv4::miniroutes() {
        let gateway = route
            .gateway
            .map(|g| format!(" gw {g}"))
            .unwrap_or_default();
        console_writeln(&format!(
            "{}: {}/{}{}",
            route.dev.name(),
            route.address,
            route.netmask,
            gateway
        ));
    }
    for route in ipv6::miniroutes() {
        let router = route
            .router
            .map(|r| format!(" gw {r}"))
            .unwrap_or_default();
        console_writeln(&format!(
            "{}: {}/{}{}",
            route.dev.name(),
            route.address,
            route.prefix_len,
            router
        ));
    }
    Ok(())
}

/// `set <name>[:type] <value...>`
fn cmd_set(args: &[String]) -> Result<()> {
    let spec = args.first().ok_or(Error::InvalidArgument)?;
    let value = args[1..].join(" ");
    let setting = resolve_setting_spec(spec)?;
    root_settings().store_typed(&setting, &value)
}

fn cmd_show(args: &[String]) -> Result<()> {
    let spec = args.first().ok_or(Error::InvalidArgument)?;
    let setting = resolve_setting_spec(spec)?;
    let value = root_settings()
        .fetch_typed(&setting)
        .ok_or(Error::NoSuchEntity)?;
    console_writeln(&format!("{spec} = {value}"));
    Ok(())
}

fn cmd_clear(args: &[String]) -> Result<()> {
    let spec = args.first().ok_or(Error::InvalidArgument)?;
    let setting = resolve_setting_spec(spec)?;
    root_settings().store(setting.tag, None)
}

fn resolve_setting_spec(spec: &str) -> Result<Setting> {
    let (name, type_override) = match spec.split_once(':') {
        Some((name, ty)) => (
            name,
            Some(SettingType::by_name(ty).ok_or(Error::InvalidArgument)?),
        ),
        None => (spec, None),
    };
    let mut setting = find_setting(name).ok_or(Error::NoSuchEntity)?;
    if let Some(ty) = type_override {
        setting.ty = ty;
    }
    Ok(setting)
}

fn cmd_imgfetch(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    fetch_uri(&uri, None)?;
    Ok(())
}

fn cmd_imgload(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    let image = fetch_uri(&uri, None)?;
    image.probe()?;
    *SELECTED_IMAGE.lock() = Some(image.name().to_string());
    Ok(())
}

fn cmd_kernel(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    let image = fetch_uri(&uri, None)?;
    if args.len() > 1 {
        *image.cmdline.lock() = Some(args[1..].join(" "));
    }
    image.probe()?;
    *SELECTED_IMAGE.lock() = Some(image.name().to_string());
    Ok(())
}

fn cmd_initrd(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    fetch_uri(&uri, None)?;
    Ok(())
}

fn cmd_imgexec(args: &[String]) -> Result<()> {
    let image = match args.first() {
        Some(name) => find_image(name).ok_or(Error::NoSuchEntity)?,
        None => {
            let selected = SELECTED_IMAGE.lock().clone();
            match selected {
                Some(name) => find_image(&name).ok_or(Error::NoSuchEntity)?,
                None => images().into_iter().next().ok_or(Error::NoSuchEntity)?,
            }
        }
    };
    exec_image(&image)
}

fn cmd_boot(args: &[String]) -> Result<()> {
    cmd_imgexec(args)
}

fn cmd_chain(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    let image = fetch_uri(&uri, None)?;
    if args.len() > 1 {
        *image.cmdline.lock() = Some(args[1..].join(" "));
    }
    exec_image(&image)
}

fn cmd_autoboot(_args: &[String]) -> Result<()> {
    let mut last = Err(Error::NoSuchEntity);
    for dev in netdev::net_devices() {
        if dev.open().is_err() {
            continue;
        }
        if let Err(err) = DhcpSession::configure(&dev) {
            last = Err(err);
            continue;
        }
        let Some(filename) = dev.settings().fetch_string(tag::BOOTFILE_NAME) else {
            last = Err(Error::NoSuchEntity);
            continue;
        };
        return cmd_chain(&[filename]);
    }
    last
}

fn cmd_sanhook(args: &[String]) -> Result<()> {
    let uri = parse_uri_arg(args)?;
    let drive = args
        .get(1)
        .map(|d| parse_drive(d))
        .transpose()?;
    san_hook(&uri, drive)?;
    Ok(())
}

fn cmd_sanunhook(args: &[String]) -> Result<()> {
    let drive = match args.first() {
        Some(d) => parse_drive(d)?,
        None => cinder_san::device::SAN_DEFAULT_DRIVE,
    };
    san_unhook(drive)
}

fn parse_drive(text: &str) -> Result<u8> {
    let value = if let Some(hex_text) = text.strip_prefix("0x") {
        u8::from_str_radix(hex_text, 16)
    } else {
        text.parse()
    };
    value.map_err(|_| Error::InvalidArgument)
}

fn cmd_sanboot(args: &[String]) -> Result<()> {
    // With a root path argument, hook first
    let device = if args.is_empty() {
        san_devices()
            .into_iter()
            .next()
            .ok_or(Error::NoSuchEntity)?
    } else {
        let uri = parse_uri_arg(args)?;
        san_hook(&uri, None)?
    };

    let plan = if device.is_cdrom() {
        crate::script::el_torito_plan(&device)?
    } else {
        // Read the MBR and hand it over the way a BIOS would
        let mut sector = alloc::vec![0u8; device.capacity().block_size];
        device.read(0, 1, &mut sector)?;
        if sector.len() >= 512 && sector[510..512] != [0x55, 0xaa] {
            return Err(Error::NoExec);
        }
        sector.truncate(512);
        BootPlan {
            entry: 0x7c00,
            segments: alloc::vec![cinder_image::Segment {
                dest: 0x7c00,
                memsz: sector.len() as u64,
                data: sector,
            }],
            register_a: None,
            info_addr: None,
        }
    };
    run_plan(&plan)
}

/// Prompt for credentials on the console
fn cmd_login(_args: &[String]) -> Result<()> {
    console_write("username: ");
    let username = read_console_line()?;
    console_write("password: ");
    let password = read_console_line()?;
    let root = root_settings();
    root.store(tag::EB_USERNAME, Some(username.as_bytes()))?;
    root.store(tag::EB_PASSWORD, Some(password.as_bytes()))?;
    Ok(())
}

fn read_console_line() -> Result<String> {
    let mut line = String::new();
    let deadline = 120 * TICKS_PER_SEC;
    let done = process::wait_until(
        || loop {
            match console_getchar() {
                Some(b'\n') | Some(b'\r') => return true,
                Some(byte) => line.push(byte as char),
                None => return false,
            }
        },
        Some(deadline),
    );
    if !done {
        return Err(Error::TimedOut);
    }
    console_write("\n");
    Ok(line)
}

/// Register the built-in command table
pub fn register_builtins() {
    for command in [
        Command { name: "echo", exec: cmd_echo },
        Command { name: "dhcp", exec: cmd_dhcp },
        Command { name: "ifconf", exec: cmd_dhcp },
        Command { name: "ifopen", exec: cmd_ifopen },
        Command { name: "ifclose", exec: cmd_ifclose },
        Command { name: "route", exec: cmd_route },
        Command { name: "set", exec: cmd_set },
        Command { name: "show", exec: cmd_show },
        Command { name: "clear", exec: cmd_clear },
        Command { name: "imgfetch", exec: cmd_imgfetch },
        Command { name: "module", exec: cmd_imgfetch },
        Command { name: "imgload", exec: cmd_imgload },
        Command { name: "imgexec", exec: cmd_imgexec },
        Command { name: "kernel", exec: cmd_kernel },
        Command { name: "initrd", exec: cmd_initrd },
        Command { name: "boot", exec: cmd_boot },
        Command { name: "chain", exec: cmd_chain },
        Command { name: "autoboot", exec: cmd_autoboot },
        Command { name: "sanhook", exec: cmd_sanhook },
        Command { name: "sanunhook", exec: cmd_sanunhook },
        Command { name: "sanboot", exec: cmd_sanboot },
        Command { name: "login", exec: cmd_login },
    ] {
        register_command(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_kernel::console::{set_console, Console};
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CapturedConsole {
        output: Mutex<String>,
    }

    impl Console for CapturedConsole {
        fn put(&self, byte: u8) {
            self.output.lock().push(byte as char);
        }

        fn get(&self) -> Option<u8> {
            None
        }
    }

    fn captured() -> Arc<CapturedConsole> {
        let console = Arc::new(CapturedConsole {
            output: Mutex::new(String::new()),
        });
        set_console(console.clone());
        console
    }

    #[test]
    fn echo_and_status() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = captured();
        let status = execute_line("echo hi");
        assert_eq!(status, 0);
        assert_eq!(console.output.lock().as_str(), "hi\n");
        assert_eq!(last_status(), 0);
    }

    #[test]
    fn unknown_command_fails_with_message() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = captured();
        let status = execute_line("definitely-not-a-command");
        assert_ne!(status, 0);
        assert!(console.output.lock().contains("command not found"));
    }

    #[test]
    fn chains_short_circuit() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = captured();
        execute_line("nope-cmd && echo yes || echo no");
        let output = console.output.lock().clone();
        assert!(!output.contains("yes\n"));
        assert!(output.contains("no\n"));

        execute_line("echo first && echo second");
        let output = console.output.lock().clone();
        assert!(output.contains("first\n"));
        assert!(output.contains("second\n"));
    }

    #[test]
    fn set_show_round_trip() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = captured();
        assert_eq!(execute_line("set gateway:ipv4 10.0.2.2"), 0);
        assert_eq!(execute_line("show gateway"), 0);
        assert!(console.output.lock().contains("gateway = 10.0.2.2"));
        assert_eq!(execute_line("clear gateway"), 0);
        let status = execute_line("show gateway");
        assert_ne!(status, 0);
    }

    #[test]
    fn error_line_includes_hex_code() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = captured();
        // show with a bogus setting name fails with no-such-entity
        execute_line("show not-a-setting");
        let output = console.output.lock().clone();
        assert!(output.contains("show: No such entity (0x"));
    }

    #[test]
    fn registered_commands_are_deduplicated() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let before = COMMANDS.read().len();
        register_builtins();
        assert_eq!(COMMANDS.read().len(), before);
    }

    #[test]
    fn boot_handler_receives_plan() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn handler(plan: &BootPlan) -> Result<()> {
            assert_eq!(plan.entry, 0x7c00);
            CALLS.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        set_boot_handler(handler);
        let plan = BootPlan {
            entry: 0x7c00,
            ..Default::default()
        };
        // An empty-segment plan with a nonzero entry still reaches the
        // handler
        run_plan(&plan).unwrap();
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        *BOOT_HANDLER.lock() = None;
    }
}
