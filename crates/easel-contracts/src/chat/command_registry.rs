#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "start",
        action: "start",
    },
    CommandSpec {
        command: "engines",
        action: "list_engines",
    },
    CommandSpec {
        command: "regen",
        action: "regenerate",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "engine",
    action: "set_engine",
}];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/start",
    "/engines",
    "/engine",
    "/regen",
    "/reset",
    "/help",
];
