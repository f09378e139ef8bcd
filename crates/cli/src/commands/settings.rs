//! Setting and deleting attributes of the configuration layers

use anyhow::Result;
use clap::Subcommand;
use toml::Value;
use wgmesh_common::config::path::parse_cli_value;
use wgmesh_common::Scope;

use crate::context::Context;
use crate::output::{display_value, print_info, print_success};

/// Value that deletes the attribute instead of setting it
pub const DELETE_MARKER: &str = "empty";

#[derive(Subcommand)]
pub enum SetCommands {
    /// Set an attribute in the global layer
    Global { attr: String, value: String },
    /// Set an attribute in a site layer
    Site {
        site: String,
        attr: String,
        value: String,
    },
    /// Set an attribute in a node layer
    Node {
        /// `<node>.<site>` or node id
        node: String,
        attr: String,
        value: String,
    },
}

/// `empty` deletes; `[a, b]` is a list; digit-only strings are integers
pub fn parse_setting(raw: &str) -> Option<Value> {
    if raw == DELETE_MARKER {
        None
    } else {
        Some(parse_cli_value(raw))
    }
}

pub fn execute(cmd: SetCommands, ctx: &Context) -> Result<()> {
    let mut controller = ctx.open_controller()?;
    let (scope, attr, raw) = match cmd {
        SetCommands::Global { attr, value } => (Scope::Global, attr, value),
        SetCommands::Site { site, attr, value } => (Scope::Site(site), attr, value),
        SetCommands::Node { node, attr, value } => {
            let id = controller.store().resolve_node_ref(&node)?;
            (Scope::Node(id), attr, value)
        }
    };

    let value = parse_setting(&raw);
    let message = match &value {
        Some(v) => format!("{} = {}", attr, display_value(v)),
        None => format!("{} deleted", attr),
    };
    if controller.store_mut().set_attr(&scope, &attr, value)? {
        print_success(&message);
    } else {
        print_info(&format!("{} unchanged", attr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting() {
        assert_eq!(parse_setting("empty"), None);
        assert_eq!(parse_setting("42"), Some(Value::Integer(42)));
        assert_eq!(parse_setting("eth0"), Some(Value::String("eth0".into())));
        assert_eq!(
            parse_setting("[a, b]"),
            Some(Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into())
            ]))
        );
    }
}
