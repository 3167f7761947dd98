#![forbid(unsafe_code)]

use keel_selector::{Attributes, LabelSelector, Selector, Set};

fn labels(pairs: &[(&str, &str)]) -> Set {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn parsed_selectors_against_objects() {
    let objects = [
        ("a", labels(&[("env", "prod"), ("tier", "web")])),
        ("b", labels(&[("env", "dev"), ("tier", "web")])),
        ("c", labels(&[("env", "prod"), ("canary", "true")])),
        ("d", labels(&[])),
    ];
    let cases = [
        ("env=prod", vec!["a", "c"]),
        ("env!=prod", vec!["b", "d"]),
        ("env in (dev,prod),tier=web", vec!["a", "b"]),
        ("env notin (prod)", vec!["b", "d"]),
        ("canary", vec!["c"]),
        ("!canary,env", vec!["a", "b"]),
        ("", vec!["a", "b", "c", "d"]),
    ];
    for (text, want) in cases {
        let sel = LabelSelector::parse(text).unwrap();
        let got: Vec<&str> = objects.iter().filter(|(_, l)| sel.matches(l)).map(|(n, _)| *n).collect();
        assert_eq!(got, want, "selector {:?}", text);
    }
}

#[test]
fn display_round_trips_through_parse() {
    let text = "env=prod,zone in (a,b),!legacy";
    let sel = LabelSelector::parse(text).unwrap();
    assert_eq!(LabelSelector::parse(&sel.to_string()).unwrap(), sel);
}

#[test]
fn uninitialized_flag_does_not_affect_matching() {
    let mut attrs = Attributes::new(labels(&[("env", "prod")])).field("metadata.name", "a");
    attrs.uninitialized = true;
    let sel = Selector::parse("env=prod", "metadata.name=a").unwrap();
    assert!(sel.matches(&attrs));
    assert_eq!(sel.requires_exact_field("metadata.name"), Some("a"));
}
