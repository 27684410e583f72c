//! Boot command line parsing.
//!
//! The command line is a whitespace-separated list of flag words. Unknown
//! words are ignored so newer loaders can pass options to newer kernels.

/// Parsed command line options.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    /// Log to the serial console.
    pub serial: bool,
    /// Do not use PCIDs even if the CPU supports them.
    pub nopcid: bool,
    /// Disable VMX even if available.
    pub novmx: bool,
    /// Keep the IOMMU disabled.
    pub nodmar: bool,
    /// Print more scheduler and delegation traces.
    pub verbose: bool,
}

impl Cmdline {
    pub fn parse(raw: &str) -> Self {
        let mut cmdline = Self::default();

        for word in raw.split_ascii_whitespace() {
            match word {
                "serial" => cmdline.serial = true,
                "nopcid" => cmdline.nopcid = true,
                "novmx" => cmdline.novmx = true,
                "nodmar" => cmdline.nodmar = true,
                "verbose" => cmdline.verbose = true,
                _ => {}
            }
        }

        cmdline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cmdline = Cmdline::parse("  serial   nopcid ignored-word\tverbose ");
        assert!(cmdline.serial);
        assert!(cmdline.nopcid);
        assert!(cmdline.verbose);
        assert!(!cmdline.novmx);
    }

    #[test]
    fn test_empty() {
        assert_eq!(Cmdline::default(), Cmdline::parse(""));
    }
}
