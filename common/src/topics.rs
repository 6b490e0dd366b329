#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    pub update: String,
    pub delta: String,
    pub rejected: String,
}

impl ShadowTopics {
    pub fn for_thing(thing_name: &str) -> Self {
        let base = format!("$aws/things/{thing_name}/shadow/update");
        Self {
            delta: format!("{base}/delta"),
            rejected: format!("{base}/rejected"),
            update: base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_scoped_to_thing() {
        let topics = ShadowTopics::for_thing("MyRaspberryPi");
        assert_eq!(topics.update, "$aws/things/MyRaspberryPi/shadow/update");
        assert_eq!(topics.delta, "$aws/things/MyRaspberryPi/shadow/update/delta");
        assert_eq!(
            topics.rejected,
            "$aws/things/MyRaspberryPi/shadow/update/rejected"
        );
    }
}
