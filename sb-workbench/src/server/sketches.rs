use super::*;
use std::fs;

// Seeded into the template directory on startup; existing files win.
pub(super) const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    (
        "blink.ino",
        r#"// Blink an LED on pin 13

void setup() {
  pinMode(13, OUTPUT);
}

void loop() {
  digitalWrite(13, HIGH);
  delay(1000);
  digitalWrite(13, LOW);
  delay(1000);
}
"#,
    ),
    (
        "serial_hello.ino",
        r#"// Print a greeting to the serial monitor once a second

void setup() {
  Serial.begin(9600);
}

void loop() {
  Serial.println("Hello World!");
  delay(1000);
}
"#,
    ),
    (
        "analog_read.ino",
        r#"// Read analog input A0 and print it to the serial monitor

void setup() {
  Serial.begin(9600);
}

void loop() {
  int sensorValue = analogRead(A0);
  Serial.print("Sensor Value: ");
  Serial.println(sensorValue);
  delay(100);
}
"#,
    ),
    (
        "servo_control.ino",
        r#"// Sweep a servo on pin 9 back and forth

#include <Servo.h>

Servo myservo;
int pos = 0;

void setup() {
  myservo.attach(9);
}

void loop() {
  for (pos = 0; pos <= 180; pos += 1) {
    myservo.write(pos);
    delay(15);
  }
  for (pos = 180; pos >= 0; pos -= 1) {
    myservo.write(pos);
    delay(15);
  }
}
"#,
    ),
    (
        "esp32_wifi.ino",
        r#"// Join a WiFi network and print the assigned address

#include <WiFi.h>

const char* ssid = "YOUR_SSID";
const char* password = "YOUR_PASSWORD";

void setup() {
  Serial.begin(115200);

  WiFi.begin(ssid, password);

  while (WiFi.status() != WL_CONNECTED) {
    delay(1000);
    Serial.println("Connecting to WiFi...");
  }

  Serial.println("Connected to WiFi!");
  Serial.print("IP address: ");
  Serial.println(WiFi.localIP());
}

void loop() {
}
"#,
    ),
];

#[derive(Clone, Debug, Serialize)]
pub struct SketchEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified_unix_ms: u64,
}

#[derive(Debug)]
pub enum StoreError {
    InvalidName(String),
    NotFound(String),
    Io(io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidName(reason) => write!(f, "invalid name: {reason}"),
            StoreError::NotFound(name) => write!(f, "not found: {name}"),
            StoreError::Io(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub(super) struct SketchStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl SketchStore {
    pub(super) fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(super) fn list(&self) -> Result<Vec<SketchEntry>, StoreError> {
        let suffix = format!(".{SKETCH_EXTENSION}");
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StoreError::Io)? {
            let entry = entry.map_err(StoreError::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&suffix) {
                continue;
            }
            let metadata = entry.metadata().map_err(StoreError::Io)?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(SketchEntry {
                name,
                size_bytes: metadata.len(),
                modified_unix_ms: metadata
                    .modified()
                    .ok()
                    .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                    .map(|duration| duration.as_millis() as u64)
                    .unwrap_or(0),
            });
        }
        // Directory enumeration order is filesystem-dependent.
        entries.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(entries)
    }

    pub(super) fn read(&self, name: &str) -> Result<(String, String), StoreError> {
        let name = normalize_name(name)?;
        match fs::read_to_string(self.dir.join(&name)) {
            Ok(content) => Ok((name, content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(name)),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    // Writes go through one lock: concurrent saves of the same name cannot
    // interleave, last writer wins cleanly.
    pub(super) async fn write(&self, name: &str, content: &str) -> Result<String, StoreError> {
        let name = normalize_name(name)?;
        let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
        let _guard = self.write_lock.lock().await;
        fs::write(self.dir.join(&name), normalized).map_err(StoreError::Io)?;
        Ok(name)
    }

    pub(super) async fn delete(&self, name: &str) -> Result<String, StoreError> {
        let name = normalize_name(name)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.dir.join(&name)) {
            Ok(()) => Ok(name),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(name)),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

pub(super) struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub(super) fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let store = Self { dir };
        store.seed_defaults()?;
        Ok(store)
    }

    fn seed_defaults(&self) -> io::Result<()> {
        for (name, content) in DEFAULT_TEMPLATES {
            let path = self.dir.join(name);
            if !path.exists() {
                fs::write(&path, content)?;
            }
        }
        Ok(())
    }

    pub(super) fn list(&self) -> Result<Vec<String>, StoreError> {
        let suffix = format!(".{SKETCH_EXTENSION}");
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StoreError::Io)? {
            let entry = entry.map_err(StoreError::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&suffix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub(super) fn read(&self, name: &str) -> Result<(String, String), StoreError> {
        let name = normalize_name(name)?;
        match fs::read_to_string(self.dir.join(&name)) {
            Ok(content) => Ok((name, content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(name)),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

// Names map straight to files under the store directory, so anything that
// could escape it or hide from listings is rejected up front.
pub(super) fn normalize_name(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidName("name cannot be empty".to_string()));
    }
    if trimmed.starts_with('.') {
        return Err(StoreError::InvalidName(
            "name cannot start with a dot".to_string(),
        ));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains("..") {
        return Err(StoreError::InvalidName(
            "name cannot contain path separators".to_string(),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(StoreError::InvalidName(
            "name cannot contain control characters".to_string(),
        ));
    }
    let suffix = format!(".{SKETCH_EXTENSION}");
    if trimmed.ends_with(&suffix) {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}{suffix}"))
    }
}
