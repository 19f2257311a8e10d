use anyhow::{anyhow, Result};

pub type StringPair = (String, String);

/// Labeled fields from the body of `btrfs subvolume show` output: everything
/// between the leading path line and the trailing snapshot list. The
/// snapshot paths can themselves contain colons (timestamps), so parsing
/// stops at the list header instead of trusting line shape.
pub fn show_fields(output: &str) -> Vec<StringPair> {
    let mut fields = Vec::new();
    for line in output.lines().skip(1) {
        let (key, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let key = key.trim();
        if key == "Snapshot(s)" {
            break;
        }
        fields.push((key.to_string(), value.trim().to_string()));
    }
    fields
}

/// Value of the named property in `btrfs property get` output, which prints
/// one `name=value` line per property.
pub fn property_value<'a>(output: &'a str, name: &str) -> Result<&'a str> {
    output
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.trim() == name {
                Some(value.trim())
            } else {
                None
            }
        })
        .ok_or_else(|| anyhow!("No {} property in the output.", name))
}

/// Drops pairs whose value is the btrfs "unset" placeholder and uppercases
/// keys so the collection feeds straight into `envy`.
pub fn envy_pairs<I: IntoIterator<Item = StringPair>>(pairs: I) -> Vec<StringPair> {
    pairs
        .into_iter()
        .filter_map(|(k, v)| {
            if v != "-" {
                Some((k.to_uppercase(), v))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn show_fields_skip_the_path_line_and_stop_at_the_snapshot_list() {
        let data = indoc!(
            r#"
            vaults/media
                Name: 			media
                UUID: 			64f0b9d2-7a85-4c13-b5e6-091d2c8f47ab
                Creation time: 		2023-11-19 08:02:54 +0100
                Flags: 			-
                Snapshot(s):
                        .stash/412/2023-11-20T06:15:09Z
                        .stash/412/2023-11-21T06:15:11Z"#
        );
        let fields = show_fields(data);
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], ("Name".to_string(), "media".to_string()));
        assert_eq!(
            fields[2],
            (
                "Creation time".to_string(),
                "2023-11-19 08:02:54 +0100".to_string()
            )
        );
        // the timestamped snapshot paths never parse as fields
        assert!(fields.iter().all(|(k, _)| !k.contains(".stash")));
    }

    #[test]
    fn property_value_finds_the_named_key() {
        assert_eq!(property_value("ro=false\n", "ro").unwrap(), "false");
        assert_eq!(
            property_value("compression=zstd\nro=true\n", "ro").unwrap(),
            "true"
        );
    }

    #[test]
    fn missing_property_is_an_error() {
        assert!(property_value("compression=zstd\n", "ro").is_err());
    }

    #[test]
    fn envy_pairs_drop_unset_and_uppercase() {
        let pairs = envy_pairs(vec![
            ("Parent UUID".to_string(), "-".to_string()),
            ("Subvolume ID".to_string(), "412".to_string()),
        ]);
        assert_eq!(pairs, vec![("SUBVOLUME ID".to_string(), "412".to_string())]);
    }
}
