use proptest::prelude::*;

use dynashell::command::{coerce, Command};
use dynashell::macros::dedent;
use dynashell::paths::VirtualPaths;
use dynashell::Value;

/// One piece of a generated command line.
#[derive(Debug, Clone)]
enum Part {
    Word(String),
    Pair(String, String),
    Flag(String, Option<String>),
}

fn word() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.]{0,8}"
}

fn part() -> impl Strategy<Value = Part> {
    prop_oneof![
        word().prop_map(Part::Word),
        (word(), word()).prop_map(|(k, v)| Part::Pair(k, v)),
        (word(), proptest::option::of(word())).prop_map(|(k, v)| Part::Flag(k, v)),
    ]
}

fn render(parts: &[Part]) -> String {
    let mut line = String::from("cmd");
    for part in parts {
        line.push(' ');
        match part {
            Part::Word(w) => line.push_str(w),
            Part::Pair(k, v) => line.push_str(&format!("{k}={v}")),
            Part::Flag(k, None) => line.push_str(&format!("--{k}")),
            Part::Flag(k, Some(v)) => line.push_str(&format!("--{k}={v}")),
        }
    }
    line
}

proptest! {
    /// N words, M pairs and K flags give N data items in order, M values
    /// and K flags; a bare flag is `true`.
    #[test]
    fn parse_counts_match(parts in proptest::collection::vec(part(), 0..12)) {
        let mut words = Vec::new();
        let mut values = std::collections::BTreeMap::new();
        let mut flags = std::collections::BTreeMap::new();
        for part in &parts {
            match part {
                Part::Word(w) => words.push(w.clone()),
                Part::Pair(k, v) => { values.insert(k.clone(), coerce(v)); }
                Part::Flag(k, v) => {
                    flags.insert(k.clone(), v.as_deref().map_or(Value::Bool(true), coerce));
                }
            }
        }

        let cmd = Command::parse(&render(&parts)).unwrap();
        prop_assert_eq!(cmd.name.as_str(), "cmd");
        prop_assert_eq!(cmd.data.iter().cloned().collect::<Vec<_>>(), words);
        prop_assert_eq!(cmd.value, values);
        prop_assert_eq!(cmd.flag, flags);
    }
}

proptest! {
    /// Coercing the text form of a coerced literal gives the same value.
    #[test]
    fn coercion_is_idempotent(text in prop_oneof![
        "-?[0-9]{1,12}",
        "-?[0-9]{1,6}\\.[0-9]{1,6}",
        "-?[0-9]{15,24}\\.[0-9]{1,3}",
        "-?[1-9]e[0-9]{1,3}",
        Just("true".to_owned()),
        Just("False".to_owned()),
        Just("None".to_owned()),
        "[a-z ]{0,12}",
    ]) {
        let once = coerce(&text);
        let twice = coerce(&once.to_string());
        prop_assert_eq!(once, twice);
    }
}

proptest! {
    /// The tokenizer never panics.
    #[test]
    fn parse_never_panics(line in "\\PC*") {
        let _ = Command::parse(&line);
    }
}

proptest! {
    /// Dedenting removes the shared prefix and nothing else.
    #[test]
    fn dedent_strips_common_indent(
        indent in "[ ]{0,8}",
        lines in proptest::collection::vec("[a-z]{1,6}", 1..6),
    ) {
        let text = lines.iter().map(|l| format!("{indent}{l}")).collect::<Vec<_>>().join("\n");
        prop_assert_eq!(dedent(&text), lines.join("\n"));
    }
}

proptest! {
    /// Unregistered prefixes come back unchanged.
    #[test]
    fn unknown_namespace_is_literal(rest in "[a-z/]{0,16}") {
        let mut paths = VirtualPaths::new();
        paths.register("shell", "/etc/dsh");
        let value = format!("other:{rest}");
        prop_assert_eq!(paths.resolve(&value), value);
    }
}
