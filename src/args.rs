use std::str::FromStr;

/// finds a name in a list of strings and returns the following value if it exists.
///
///  E.g. for arguments ["PX", "123"] it returns "123"
pub fn named_option<R: FromStr>(args: &[String], name: &str) -> Result<Option<R>, R::Err> {
    let option_name = name.to_uppercase();
    args.iter()
        .position(|a| a.to_uppercase() == option_name)
        .and_then(|i| args.get(i + 1))
        .map(|a| a.parse::<R>())
        .transpose()
}

/// finds a name in a list of strings and returns all values following it
pub fn named_option_list<'a>(params: &'a [String], name: &str) -> Option<&'a [String]> {
    let option_name = name.to_uppercase();
    params
        .iter()
        .position(|e| e.to_uppercase() == option_name)
        .map(|i| &params[i + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_named_value_case_insensitively() {
        let args = params(&["value", "px", "150"]);
        assert_eq!(named_option::<u64>(&args, "PX").unwrap(), Some(150));
    }

    #[test]
    fn absent_name_yields_none() {
        let args = params(&["value"]);
        assert_eq!(named_option::<u64>(&args, "PX").unwrap(), None);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let args = params(&["PX", "soon"]);
        assert!(named_option::<u64>(&args, "PX").is_err());
    }

    #[test]
    fn trailing_list_follows_the_name() {
        let args = params(&["BLOCK", "0", "STREAMS", "a", "b", "0-0", "0-0"]);
        let rest = named_option_list(&args, "streams").unwrap();
        assert_eq!(rest, &params(&["a", "b", "0-0", "0-0"])[..]);
    }
}
