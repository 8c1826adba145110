//! Version reporting.

use anyhow::Result;

#[derive(Debug)]
pub struct Version {
    version: &'static str,
}

impl Version {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn print(&self, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::json!({ "version": self.version }));
        } else {
            println!("mpyctl {}", self.version);
        }
        Ok(())
    }
}
