/// Topic names under `<base><device id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(base: &str, device_id: &str) -> Self {
        Self {
            root: format!("{base}{device_id}"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn device_get(&self) -> String {
        format!("{}/device/get", self.root)
    }

    pub fn device_type(&self) -> String {
        format!("{}/device/type", self.root)
    }

    pub fn device_ip(&self) -> String {
        format!("{}/device/ip", self.root)
    }

    pub fn device_revision(&self) -> String {
        format!("{}/device/revision", self.root)
    }

    /// `index` is zero-based; topics are numbered from 1.
    pub fn output(&self, index: usize) -> String {
        format!("{}/O{}", self.root, index + 1)
    }

    pub fn input_value(&self, index: usize) -> String {
        format!("{}/I{}/val", self.root, index + 1)
    }

    pub fn input_type(&self, index: usize) -> String {
        format!("{}/I{}/type", self.root, index + 1)
    }

    /// Zero-based output index addressed by `topic`, if any.
    pub fn parse_output(&self, topic: &str, count: usize) -> Option<usize> {
        let digits = topic.strip_prefix(self.root.as_str())?.strip_prefix("/O")?;
        if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let number: usize = digits.parse().ok()?;
        (1..=count).contains(&number).then(|| number - 1)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn topics_are_rooted_at_base_and_id() {
        let topics = Topics::new("opta/", "gw1");
        assert_eq!(topics.device_get(), "opta/gw1/device/get");
        assert_eq!(topics.output(0), "opta/gw1/O1");
        assert_eq!(topics.input_value(7), "opta/gw1/I8/val");
        assert_eq!(topics.input_type(2), "opta/gw1/I3/type");
    }

    #[test]
    fn parse_output_rejects_foreign_and_out_of_range_topics() {
        let topics = Topics::new("opta/", "gw1");
        assert_eq!(topics.parse_output("opta/gw1/O4", 4), Some(3));
        assert_eq!(topics.parse_output("opta/gw1/O5", 4), None);
        assert_eq!(topics.parse_output("opta/gw1/O0", 4), None);
        assert_eq!(topics.parse_output("opta/gw2/O1", 4), None);
        assert_eq!(topics.parse_output("opta/gw1/device/get", 4), None);
    }

    #[test]
    fn parse_output_accepts_plain_digits_only() {
        let topics = Topics::new("opta/", "gw1");
        assert_eq!(topics.parse_output("opta/gw1/O1", 4), Some(0));
        assert_eq!(topics.parse_output("opta/gw1/O+1", 4), None);
        assert_eq!(topics.parse_output("opta/gw1/O01", 4), None);
        assert_eq!(topics.parse_output("opta/gw1/O", 4), None);
        assert_eq!(topics.parse_output("opta/gw1/O1 ", 4), None);
    }
}
