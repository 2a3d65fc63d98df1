use crate::error::BlockwardenError;

/// External label carrying a block's compactor shard, formatted as `"i_of_n"`.
pub const COMPACTOR_SHARD_ID_LABEL: &str = "__compactor_shard_id__";

/// Formats a zero-based shard index as the 1-based `"{index+1}_of_{count}"` label value.
pub fn format_shard_id(index: u64, count: u64) -> String {
    format!("{}_of_{}", index + 1, count)
}

/// Parses an `"i_of_n"` label value into a zero-based index and the shard count.
pub(crate) fn parse_shard_id(value: &str) -> Result<(u64, u64), BlockwardenError> {
    let invalid = || BlockwardenError::InvalidShardId(value.to_string());
    let (index, count) = value.split_once("_of_").ok_or_else(invalid)?;
    let index: u64 = index.parse().map_err(|_| invalid())?;
    let count: u64 = count.parse().map_err(|_| invalid())?;
    if index == 0 || count == 0 || index > count {
        return Err(invalid());
    }
    Ok((index - 1, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_format_shard_id() {
        assert_eq!(format_shard_id(0, 4), "1_of_4");
        assert_eq!(format_shard_id(3, 4), "4_of_4");
    }

    #[rstest]
    #[case("1_of_4", Some((0, 4)))]
    #[case("4_of_4", Some((3, 4)))]
    #[case("0_of_4", None)]
    #[case("5_of_4", None)]
    #[case("1_of_0", None)]
    #[case("1-of-4", None)]
    #[case("", None)]
    fn test_parse_shard_id(#[case] value: &str, #[case] expected: Option<(u64, u64)>) {
        assert_eq!(parse_shard_id(value).ok(), expected);
    }
}
