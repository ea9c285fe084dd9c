//! Console system.
//!
//! Provides:
//! - Console variables (cvars) with typed values and access flags
//! - Command registration and execution
//! - Info-string assembly from SERVERINFO/SYSTEMINFO cvars
//!
//! # Usage
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("sv_cheats", CvarValue::Int(0), CvarFlags::SYSTEMINFO | CvarFlags::ROM, "");
//! console.register_command("status", |_args, ctx| { ctx.print("no map"); Ok(()) });
//! console.exec("status")?;
//! ```

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context};
use tracing::debug;

use crate::info;
use crate::parse::tokenize_line;

/// Console variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    String(String),
}

impl CvarValue {
    pub fn as_int(&self) -> i64 {
        match self {
            CvarValue::Int(v) => *v,
            CvarValue::Float(v) => *v as i64,
            CvarValue::String(s) => i64::from(crate::parse::atoi(s)),
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            CvarValue::Float(v) => *v,
            CvarValue::Int(v) => *v as f64,
            CvarValue::String(s) => f64::from(crate::parse::atof(s)),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            CvarValue::String(s) => s.clone(),
            CvarValue::Int(v) => v.to_string(),
            CvarValue::Float(v) => v.to_string(),
        }
    }

    /// Parses `text` as the same kind of value as `self`.
    fn parse_like(&self, text: &str) -> anyhow::Result<CvarValue> {
        Ok(match self {
            CvarValue::Int(_) => CvarValue::Int(
                text.trim()
                    .parse()
                    .with_context(|| format!("'{text}' is not an integer"))?,
            ),
            CvarValue::Float(_) => CvarValue::Float(
                text.trim()
                    .parse()
                    .with_context(|| format!("'{text}' is not a number"))?,
            ),
            CvarValue::String(_) => CvarValue::String(text.to_string()),
        })
    }
}

impl std::fmt::Display for CvarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{}", v),
            CvarValue::Float(v) => write!(f, "{}", v),
            CvarValue::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        const NONE = 0;
        const ARCHIVE = 1 << 0;      // Saved to config
        const USERINFO = 1 << 1;     // Sent with connect
        const SERVERINFO = 1 << 2;   // Sent in response to status queries
        const SYSTEMINFO = 1 << 3;   // Duplicated on all clients
        const LATCH = 1 << 4;        // Applied on next map load
        const ROM = 1 << 5;          // Not settable by the user
        const CHEAT = 1 << 6;        // Requires sv_cheats
        const USER_CREATED = 1 << 7;
    }
}

/// Console variable metadata.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub value: CvarValue,
    pub default: CvarValue,
    pub latched: Option<CvarValue>,
    pub description: String,
    pub flags: CvarFlags,
    pub modification_count: u32,
}

/// Cvar storage. Names are case-insensitive.
#[derive(Debug, Default)]
pub struct CvarTable {
    cvars: BTreeMap<String, Cvar>,
    modified: CvarFlags,
}

impl CvarTable {
    /// Registers a cvar, or merges `flags` into an existing one.
    pub fn register(&mut self, name: &str, default: CvarValue, flags: CvarFlags, description: &str) {
        let key = name.to_ascii_lowercase();
        if let Some(cvar) = self.cvars.get_mut(&key) {
            if cvar.flags.contains(CvarFlags::USER_CREATED) {
                // A value typed before registration keeps its text but takes the
                // registered type.
                cvar.value = default
                    .parse_like(&cvar.value.as_string())
                    .unwrap_or_else(|_| default.clone());
                cvar.flags.remove(CvarFlags::USER_CREATED);
            }
            cvar.flags |= flags;
            cvar.default = default;
            if !description.is_empty() {
                cvar.description = description.to_string();
            }
            self.modified |= flags;
            return;
        }
        self.cvars.insert(
            key,
            Cvar {
                name: name.to_string(),
                value: default.clone(),
                default,
                latched: None,
                description: description.to_string(),
                flags,
                modification_count: 0,
            },
        );
        self.modified |= flags;
    }

    pub fn get(&self, name: &str) -> Option<&Cvar> {
        self.cvars.get(&name.to_ascii_lowercase())
    }

    /// Integer value, 0 when unknown.
    pub fn int(&self, name: &str) -> i64 {
        self.get(name).map(|c| c.value.as_int()).unwrap_or(0)
    }

    /// Float value, 0.0 when unknown.
    pub fn float(&self, name: &str) -> f64 {
        self.get(name).map(|c| c.value.as_float()).unwrap_or(0.0)
    }

    /// String value, empty when unknown.
    pub fn string(&self, name: &str) -> String {
        self.get(name).map(|c| c.value.as_string()).unwrap_or_default()
    }

    /// User-level set: honours ROM, CHEAT and LATCH. Unknown names become
    /// user-created string cvars.
    pub fn set(&mut self, name: &str, text: &str) -> anyhow::Result<()> {
        self.set_inner(name, text, false)
    }

    /// Engine-level set: ignores ROM/CHEAT and applies latched cvars at once.
    pub fn force_set(&mut self, name: &str, text: &str) -> anyhow::Result<()> {
        self.set_inner(name, text, true)
    }

    fn set_inner(&mut self, name: &str, text: &str, force: bool) -> anyhow::Result<()> {
        let cheats = self.int("sv_cheats") != 0;
        let key = name.to_ascii_lowercase();
        if !self.cvars.contains_key(&key) {
            self.register(
                name,
                CvarValue::String(text.to_string()),
                CvarFlags::USER_CREATED,
                "",
            );
            return Ok(());
        }
        let Some(cvar) = self.cvars.get_mut(&key) else {
            return Ok(());
        };

        let value = cvar
            .default
            .parse_like(text)
            .with_context(|| format!("cvar {}", cvar.name))?;

        if !force {
            if cvar.flags.contains(CvarFlags::ROM) {
                bail!("{} is read only.", cvar.name);
            }
            if cvar.flags.contains(CvarFlags::CHEAT) && !cheats {
                bail!("{} is cheat protected.", cvar.name);
            }
            if cvar.flags.contains(CvarFlags::LATCH) {
                if value != cvar.value {
                    debug!(cvar = %cvar.name, %value, "latched");
                    cvar.latched = Some(value);
                } else {
                    cvar.latched = None;
                }
                return Ok(());
            }
        }

        if value != cvar.value {
            cvar.value = value;
            cvar.latched = None;
            cvar.modification_count += 1;
            self.modified |= cvar.flags;
        }
        Ok(())
    }

    /// Moves latched values into place. Called on map load.
    pub fn apply_latched(&mut self) {
        for cvar in self.cvars.values_mut() {
            if let Some(v) = cvar.latched.take() {
                if v != cvar.value {
                    cvar.value = v;
                    cvar.modification_count += 1;
                    self.modified |= cvar.flags;
                }
            }
        }
    }

    /// Returns whether any cvar carrying one of `flags` changed since the last
    /// call, clearing the mark.
    pub fn take_modified(&mut self, flags: CvarFlags) -> bool {
        let hit = self.modified.intersects(flags);
        self.modified.remove(flags);
        hit
    }

    /// Builds an info string of every cvar with `flag`.
    pub fn info_string(&self, flag: CvarFlags) -> String {
        let mut out = String::new();
        for cvar in self.cvars.values().filter(|c| c.flags.contains(flag)) {
            match info::set_value_for_key(&out, &cvar.name, &cvar.value.as_string()) {
                Ok(s) => out = s,
                Err(e) => debug!(cvar = %cvar.name, error = %e, "left out of info string"),
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cvar> {
        self.cvars.values()
    }
}

/// Command handler function type.
pub type CommandHandler =
    Box<dyn Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Context passed to command handlers.
pub struct ConsoleContext<'a> {
    /// Output buffer for command responses.
    pub output: Vec<String>,
    pub cvars: &'a mut CvarTable,
}

impl ConsoleContext<'_> {
    pub fn print(&mut self, msg: impl Into<String>) {
        self.output.push(msg.into());
    }
}

/// The console.
pub struct Console {
    cvars: CvarTable,
    commands: HashMap<String, CommandHandler>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let mut console = Self {
            cvars: CvarTable::default(),
            commands: HashMap::new(),
        };
        console.register_builtin_commands();
        console
    }

    fn register_builtin_commands(&mut self) {
        self.register_command("echo", |args, ctx| {
            ctx.print(args.join(" "));
            Ok(())
        });

        self.register_command("help", |args, ctx| {
            let Some(name) = args.first() else {
                ctx.print("Type 'cvarlist' for variables, 'set <cvar> <value>' to change one.");
                return Ok(());
            };
            let line = ctx
                .cvars
                .get(name)
                .filter(|c| !c.description.is_empty())
                .map(|c| format!("{}: {}", c.name, c.description))
                .unwrap_or_else(|| format!("No help for '{name}'"));
            ctx.print(line);
            Ok(())
        });

        self.register_command("cvarlist", |_args, ctx| {
            let lines: Vec<String> = ctx
                .cvars
                .iter()
                .map(|c| format!("{} {} = {} (default: {})", flag_chars(c.flags), c.name, c.value, c.default))
                .collect();
            let total = lines.len();
            for line in lines {
                ctx.print(line);
            }
            ctx.print(format!("{total} total cvars"));
            Ok(())
        });

        self.register_command("set", |args, ctx| {
            if args.len() < 2 {
                bail!("usage: set <variable> <value>");
            }
            let value = args[1..].join(" ");
            ctx.cvars.set(args[0], &value)?;
            let shown = ctx.cvars.string(args[0]);
            ctx.print(format!("{} = \"{}\"", args[0], shown));
            Ok(())
        });
    }

    /// Registers a console variable.
    pub fn register_cvar(&mut self, name: &str, default: CvarValue, flags: CvarFlags, description: &str) {
        self.cvars.register(name, default, flags, description);
    }

    /// Registers a command.
    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[&str], &mut ConsoleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.to_ascii_lowercase(), Box::new(handler));
    }

    /// Executes a console command line.
    ///
    /// A bare cvar name prints it, `name value` sets it.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Vec::new());
        }

        let tokens = tokenize_line(line);
        let Some((cmd_name, rest)) = tokens.split_first() else {
            return Ok(Vec::new());
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();

        let mut ctx = ConsoleContext {
            output: Vec::new(),
            cvars: &mut self.cvars,
        };

        if let Some(handler) = self.commands.get(&cmd_name.to_ascii_lowercase()) {
            handler(&args, &mut ctx).with_context(|| format!("command '{}'", cmd_name))?;
            return Ok(ctx.output);
        }

        let known = ctx
            .cvars
            .get(cmd_name)
            .map(|c| (c.name.clone(), c.value.clone(), c.default.clone()));
        match known {
            Some((name, value, default)) if args.is_empty() => {
                ctx.print(format!("\"{}\" is {} default: {}", name, value, default));
            }
            Some(_) => {
                ctx.cvars.set(cmd_name, &args.join(" "))?;
            }
            None => ctx.print(format!("Unknown command \"{}\"", cmd_name)),
        }
        Ok(ctx.output)
    }

    pub fn cvars(&self) -> &CvarTable {
        &self.cvars
    }

    pub fn cvars_mut(&mut self) -> &mut CvarTable {
        &mut self.cvars
    }
}

fn flag_chars(flags: CvarFlags) -> String {
    [
        (CvarFlags::SERVERINFO, 'S'),
        (CvarFlags::USERINFO, 'U'),
        (CvarFlags::ROM, 'R'),
        (CvarFlags::ARCHIVE, 'A'),
        (CvarFlags::LATCH, 'L'),
        (CvarFlags::CHEAT, 'C'),
    ]
    .iter()
    .map(|(f, c)| if flags.contains(*f) { *c } else { ' ' })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_cvar_roundtrip() {
        let mut console = Console::new();
        console.register_cvar("test_var", CvarValue::Int(42), CvarFlags::NONE, "Test variable");
        assert_eq!(console.cvars().int("test_var"), 42);

        console.exec("set test_var 100").unwrap();
        assert_eq!(console.cvars().int("TEST_VAR"), 100);
        assert!(console.exec("set test_var abc").is_err());
    }

    #[test]
    fn rom_cheat_and_latch() {
        let mut cvars = CvarTable::default();
        cvars.register("sv_cheats", CvarValue::Int(0), CvarFlags::ROM, "");
        cvars.register("g_speed", CvarValue::Int(250), CvarFlags::CHEAT, "");
        cvars.register("g_gametype", CvarValue::Int(0), CvarFlags::LATCH, "");

        assert!(cvars.set("sv_cheats", "1").is_err());
        assert!(cvars.set("g_speed", "400").is_err());

        cvars.set("g_gametype", "7").unwrap();
        assert_eq!(cvars.int("g_gametype"), 0);
        cvars.apply_latched();
        assert_eq!(cvars.int("g_gametype"), 7);

        cvars.force_set("sv_cheats", "1").unwrap();
        cvars.set("g_speed", "400").unwrap();
        assert_eq!(cvars.int("g_speed"), 400);
    }

    #[test]
    fn serverinfo_tracks_changes() {
        let mut cvars = CvarTable::default();
        cvars.register(
            "sv_hostname",
            CvarValue::String("noname".into()),
            CvarFlags::SERVERINFO,
            "",
        );
        assert!(cvars.take_modified(CvarFlags::SERVERINFO));
        assert!(!cvars.take_modified(CvarFlags::SERVERINFO));
        cvars.set("sv_hostname", "Duel Arena").unwrap();
        assert!(cvars.take_modified(CvarFlags::SERVERINFO));
        assert_eq!(
            info::value_for_key(&cvars.info_string(CvarFlags::SERVERINFO), "sv_hostname"),
            "Duel Arena"
        );
    }

    #[test]
    fn bare_name_prints_and_sets() {
        let mut console = Console::new();
        console.register_cvar("sv_fps", CvarValue::Int(20), CvarFlags::NONE, "");
        let out = console.exec("sv_fps").unwrap();
        assert!(out[0].contains("20"));
        console.exec("sv_fps 40").unwrap();
        assert_eq!(console.cvars().int("sv_fps"), 40);
        let out = console.exec("nosuchthing").unwrap();
        assert!(out[0].contains("Unknown command"));
    }
}
