use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let file = file.as_ref();
        let document = std::fs::read_to_string(file)
            .context(format!("Reading configuration {} failed", file.display()))?;
        let document = DocumentMut::from_str(&document)
            .context(format!("Configuration {} is not valid TOML", file.display()))?;
        Ok(Self { document })
    }

    fn write_toml<P: AsRef<Path>>(&self, file: P) -> Result<(), Error> {
        let file = file.as_ref();
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(file, self.document.to_string())
            .context(format!("Writing configuration {} failed", file.display()))
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    fn edit_toml(&mut self, config: &Configuration) -> Result<(), Error> {
        // to_document does not prettify, so round-trip through a pretty string instead
        let pretty_string = toml_edit::ser::to_string_pretty(config)?;
        self.document = DocumentMut::from_str(&pretty_string)?;
        Ok(())
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        let toml = Self::load_toml(&file)?;
        toml.into_configuration().context(format!(
            "Configuration {} is invalid",
            file.as_ref().display()
        ))
    }

    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), Error> {
        let mut toml = Self::load_toml(&file).unwrap_or(TomlConfiguration {
            document: DocumentMut::default(),
        });
        toml.edit_toml(config)?;
        toml.write_toml(file)
    }
}
