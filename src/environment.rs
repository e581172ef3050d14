use std::collections::BTreeMap;

use serde_yaml::Value;

/// The flat variable mapping every template is rendered against.
/// Values are YAML-typed so templates see the same scalars the
/// documents themselves carry.
pub type Environment = BTreeMap<String, Value>;

/// Built-in defaults. Downstream templates may assume every key listed
/// here is present; host overrides replace values wholesale per key.
pub fn defaults() -> Environment {
    let mut env = Environment::new();
    env.insert("LANG".into(), Value::from("C.UTF-8"));
    env.insert("KEYMAP".into(), Value::from("us"));
    env.insert("TIMEZONE".into(), Value::from("UTC"));
    env.insert("INTERNAL_CIDR".into(), Value::from("10.87.240.0/24"));
    env.insert("PODMAN_CIDR".into(), Value::from("10.88.0.0/16"));
    env.insert("NSPAWN_CIDR".into(), Value::from("10.89.0.0/16"));
    env.insert("DEBUG".into(), Value::from(false));
    env.insert("AUTOLOGIN".into(), Value::from(false));
    env
}

/// Compose the effective environment: defaults, then host overrides,
/// then the identity keys derived from the caller's parameters. The
/// identity keys always win.
pub fn compose(resource_id: &str, hostname: &str, overrides: &Environment) -> Environment {
    let mut env = defaults();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    let short = hostname.split('.').next().unwrap_or(hostname);
    env.insert("RESOURCE_ID".into(), Value::from(resource_id));
    env.insert("HOSTNAME".into(), Value::from(hostname));
    env.insert("HOSTNAME_SHORT".into(), Value::from(short));
    env
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let env = defaults();
        for key in [
            "LANG",
            "KEYMAP",
            "TIMEZONE",
            "INTERNAL_CIDR",
            "PODMAN_CIDR",
            "NSPAWN_CIDR",
            "DEBUG",
            "AUTOLOGIN",
        ] {
            assert!(env.contains_key(key), "missing default {}", key);
        }
    }

    #[test]
    fn overrides_replace_defaults() {
        let overrides = maplit::btreemap! {
            "TIMEZONE".to_string() => Value::from("Europe/Berlin"),
            "EXTRA".to_string() => Value::from(42),
        };
        let env = compose("m1", "box.example.org", &overrides);
        assert_eq!(env["TIMEZONE"], Value::from("Europe/Berlin"));
        assert_eq!(env["EXTRA"], Value::from(42));
        assert_eq!(env["LANG"], Value::from("C.UTF-8"));
    }

    #[test]
    fn identity_keys_derive_from_parameters() {
        let env = compose("m1", "box.example.org", &Environment::new());
        assert_eq!(env["RESOURCE_ID"], Value::from("m1"));
        assert_eq!(env["HOSTNAME"], Value::from("box.example.org"));
        assert_eq!(env["HOSTNAME_SHORT"], Value::from("box"));
    }

    #[test]
    fn identity_keys_win_over_overrides() {
        let overrides = maplit::btreemap! {
            "HOSTNAME".to_string() => Value::from("spoofed"),
        };
        let env = compose("m1", "box.example.org", &overrides);
        assert_eq!(env["HOSTNAME"], Value::from("box.example.org"));
    }
}
