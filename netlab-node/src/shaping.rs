//! Traffic-control settings saved on an interface and the `tc` commands that install them.

use std::time::Duration;

/// Handle of the htb root installed when a bandwidth is set.
pub const HTB_ROOT: &str = "5:0";
/// Handle of the htb class the netem qdisc (if any) hangs off.
pub const HTB_CLASS: &str = "5:1";

/// Link shaping parameters. Every field is optional; an empty value installs nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkShaping {
    /// Rate limit in Mbit/s.
    pub bandwidth_mbit: Option<f64>,
    pub delay: Option<Duration>,
    pub jitter: Option<Duration>,
    /// Loss in percent, `0..=100`.
    pub loss: Option<f64>,
    /// Maximum queue length in packets.
    pub limit: Option<u32>,
}

/// Commands installing a [`LinkShaping`] on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingPlan {
    /// Removes whatever root qdisc is there. Fails harmlessly when there is none.
    pub reset: String,
    pub commands: Vec<String>,
    /// Where further qdiscs attach, e.g. `parent 5:1`.
    pub parent: String,
}

impl LinkShaping {
    /// Rate limit in Mbit/s.
    pub fn with_bandwidth(mut self, mbit: f64) -> Self {
        self.bandwidth_mbit = Some(mbit);
        self
    }

    /// Fixed one-way delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Random variation added to the delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Packet loss in percent.
    pub fn with_loss(mut self, percent: f64) -> Self {
        self.loss = Some(percent);
        self
    }

    /// Queue length in packets.
    pub fn with_limit(mut self, packets: u32) -> Self {
        self.limit = Some(packets);
        self
    }

    /// Whether no shaping is asked for at all.
    pub fn is_empty(&self) -> bool {
        self.plan("x").is_none()
    }

    /// The commands installing this configuration on `dev`, or `None` if there is nothing to do.
    /// Out-of-range values are logged and skipped.
    pub fn plan(&self, dev: &str) -> Option<ShapingPlan> {
        let mut commands = Vec::new();
        let mut parent = " root ".to_owned();

        match self.bandwidth_mbit {
            Some(bw) if bw > 0.0 => {
                commands.push(format!("tc qdisc add dev {dev} root handle {HTB_ROOT} htb default 1"));
                commands.push(format!(
                    "tc class add dev {dev} parent {HTB_ROOT} classid {HTB_CLASS} htb rate {bw}Mbit burst 15k"
                ));
                parent = format!(" parent {HTB_CLASS} ");
            }
            Some(bw) => tracing::error!(dev, bw, "bandwidth must be positive, ignoring"),
            None => {}
        }

        let loss = match self.loss {
            Some(loss) if !(0.0..=100.0).contains(&loss) => {
                tracing::error!(dev, loss, "loss must be a percentage, ignoring");
                None
            }
            Some(loss) if loss == 0.0 => None,
            other => other,
        };

        let mut netem = String::new();
        if self.delay.is_some() || self.jitter.is_some() {
            let delay = self.delay.unwrap_or_default();
            netem.push_str(&format!(" delay {}us", delay.as_micros()));
            if let Some(jitter) = self.jitter {
                netem.push_str(&format!(" {}us", jitter.as_micros()));
            }
        }
        if let Some(loss) = loss {
            netem.push_str(&format!(" loss {loss}%"));
        }
        if let Some(limit) = self.limit {
            netem.push_str(&format!(" limit {limit}"));
        }

        if !netem.is_empty() {
            commands.push(format!("tc qdisc add dev {dev}{parent}handle 10: netem{netem}"));
            parent = " parent 10:1 ".to_owned();
        }

        if commands.is_empty() {
            return None;
        }

        Some(ShapingPlan {
            reset: format!("tc qdisc del dev {dev} root"),
            commands,
            parent: parent.trim().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_shaping_installs_nothing() {
        assert!(LinkShaping::default().plan("s1-eth1").is_none());
        assert!(LinkShaping::default().with_loss(0.0).is_empty());
    }

    #[test]
    fn bandwidth_only() {
        let plan = LinkShaping::default().with_bandwidth(10.0).plan("s1-eth1").unwrap();

        assert_eq!(plan.reset, "tc qdisc del dev s1-eth1 root");
        assert_eq!(
            plan.commands,
            vec![
                "tc qdisc add dev s1-eth1 root handle 5:0 htb default 1",
                "tc class add dev s1-eth1 parent 5:0 classid 5:1 htb rate 10Mbit burst 15k",
            ]
        );
        assert_eq!(plan.parent, "parent 5:1");
    }

    #[test]
    fn netem_hangs_off_htb() {
        let plan = LinkShaping::default()
            .with_bandwidth(100.0)
            .with_delay(Duration::from_millis(5))
            .with_loss(1.5)
            .plan("h1-eth0")
            .unwrap();

        assert_eq!(
            plan.commands[2],
            "tc qdisc add dev h1-eth0 parent 5:1 handle 10: netem delay 5000us loss 1.5%"
        );
        assert_eq!(plan.parent, "parent 10:1");
    }

    #[test]
    fn netem_at_root_without_bandwidth() {
        let plan = LinkShaping::default()
            .with_jitter(Duration::from_micros(200))
            .with_limit(1000)
            .plan("h1-eth0")
            .unwrap();

        assert_eq!(
            plan.commands,
            vec!["tc qdisc add dev h1-eth0 root handle 10: netem delay 0us 200us limit 1000"]
        );
    }

    #[test]
    fn invalid_values_are_skipped() {
        assert!(LinkShaping::default().with_bandwidth(-1.0).with_loss(150.0).is_empty());
    }
}
