/*!
Builders de lignes brutes de probe

Produisent des sorties conformes aux layouts server_metrics / user_activity,
avec surcharge token par token pour fabriquer des cas invalides.
*/

/// Ligne `server_metrics` (16 tokens séparés par des virgules)
#[derive(Debug, Clone)]
pub struct ServerLineBuilder {
    tokens: Vec<String>,
}

impl Default for ServerLineBuilder {
    fn default() -> Self {
        let tokens = [
            "x86_64",
            "Ubuntu 22.04.4 LTS",
            "2",
            "16",
            "7.9G/31.2G",
            "25",
            "120G/457G",
            "27%",
            "0.42",
            "0.37",
            "0.30",
            "2025-01-06 07:45",
            "88",
            "3",
            "0",
            "2",
        ];
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl ServerLineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remplace le token à `position`
    pub fn token(mut self, position: usize, value: &str) -> Self {
        if position >= self.tokens.len() {
            self.tokens.resize(position + 1, String::new());
        }
        self.tokens[position] = value.to_string();
        self
    }

    /// Coupe la ligne après `len` tokens
    pub fn truncate(mut self, len: usize) -> Self {
        self.tokens.truncate(len);
        self
    }

    pub fn architecture(self, value: &str) -> Self {
        self.token(0, value)
    }

    pub fn virtual_cpus(self, value: &str) -> Self {
        self.token(3, value)
    }

    pub fn ram(self, used_total: &str) -> Self {
        self.token(4, used_total)
    }

    pub fn ram_percentage(self, value: &str) -> Self {
        self.token(5, value)
    }

    pub fn disk(self, used_total: &str) -> Self {
        self.token(6, used_total)
    }

    pub fn disk_percentage(self, value: &str) -> Self {
        self.token(7, value)
    }

    pub fn loads(self, one: &str, five: &str, fifteen: &str) -> Self {
        self.token(8, one).token(9, five).token(10, fifteen)
    }

    pub fn build(&self) -> String {
        format!("{}\n", self.tokens.join(","))
    }
}

/// Ligne `user_activity` (séparateur : espaces)
#[derive(Debug, Clone)]
pub struct UserLineBuilder {
    tokens: Vec<String>,
}

impl UserLineBuilder {
    pub fn new(username: &str) -> Self {
        let tokens = [username, "3.5", "1.2", "nan", "12", "bash", "2025-01-09", "nan"];
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn token(mut self, position: usize, value: &str) -> Self {
        if position >= self.tokens.len() {
            self.tokens.resize(position + 1, "nan".to_string());
        }
        self.tokens[position] = value.to_string();
        self
    }

    pub fn cpu(self, value: &str) -> Self {
        self.token(1, value)
    }

    pub fn memory(self, value: &str) -> Self {
        self.token(2, value)
    }

    pub fn disk_gb(self, value: &str) -> Self {
        self.token(3, value)
    }

    pub fn processes(self, value: &str) -> Self {
        self.token(4, value)
    }

    pub fn top_process(self, value: &str) -> Self {
        self.token(5, value)
    }

    /// Nom complet sans espaces : le layout est séparé par des blancs
    pub fn full_name(self, value: &str) -> Self {
        self.token(7, value)
    }

    pub fn build(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Sortie complète du probe user_activity : en-tête, séparateur, lignes
pub fn user_output(lines: &[UserLineBuilder]) -> String {
    let mut out = String::from("USERNAME CPU% MEM% DISK_GB PROCS TOP LAST_LOGIN NAME\n");
    out.push_str("-------- ---- ---- ------- ----- --- ---------- ----\n");
    for line in lines {
        out.push_str(&line.build());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_probe::{parse_line, parse_lines, server_metrics_schema, user_activity_schema};

    #[test]
    fn test_default_server_line_is_valid() {
        let line = ServerLineBuilder::new().build();
        let record = parse_line(&line, server_metrics_schema()).unwrap();
        assert!(record.issues.is_empty());
        assert_eq!(record.integer("virtual_cpus"), Some(16));
    }

    #[test]
    fn test_user_output_parses_every_line() {
        let out = user_output(&[
            UserLineBuilder::new("alice").cpu("120.5").disk_gb("3.2"),
            UserLineBuilder::new("bob").full_name("Bob"),
        ]);
        let records = parse_lines(&out, user_activity_schema());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_ok()));
    }
}
