// ---------- JSON schema for the rules file ----------
pub const RULES_SCHEMA: &str = r##"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "httpe rules",
  "type": "object",
  "required": ["rules"],
  "properties": {
    "rules": {
      "type": "array",
      "items": { "$ref": "#/definitions/rule" }
    }
  },
  "definitions": {
    "rule": {
      "type": "object",
      "required": ["on", "do"],
      "additionalProperties": false,
      "properties": {
        "name": { "type": "string" },
        "on": { "$ref": "#/definitions/on" },
        "do": { "$ref": "#/definitions/do" },
        "with": { "$ref": "#/definitions/with" },
        "respond": { "$ref": "#/definitions/respond" },
        "post_action": { "$ref": "#/definitions/post_action" }
      }
    },
    "on": {
      "type": "object",
      "required": ["path"],
      "additionalProperties": false,
      "properties": {
        "path": { "type": "string", "pattern": "^/" },
        "methods": { "type": "array", "items": { "type": "string", "minLength": 1 } }
      }
    },
    "do": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "run.script": { "type": "string" },
        "send.email": { "$ref": "#/definitions/email" },
        "answer.content": { "type": "string" },
        "answer.file": { "type": "string" },
        "redirect.permanent": { "type": "string" },
        "redirect.temporary": { "type": "string" },
        "serve.directory": { "type": "string" },
        "render.buttons": {
          "type": "array",
          "items": {
            "type": "object",
            "required": ["name", "url"],
            "additionalProperties": false,
            "properties": {
              "name": { "type": "string" },
              "url": { "type": "string" },
              "classes": { "type": "string" }
            }
          }
        },
        "args": { "$ref": "#/definitions/args" }
      }
    },
    "post_action": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "run.script": { "type": "string" },
        "send.email": { "$ref": "#/definitions/email" },
        "args": { "$ref": "#/definitions/args" }
      }
    },
    "email": {
      "type": "object",
      "required": ["to"],
      "additionalProperties": false,
      "properties": {
        "from": { "type": "string" },
        "to": { "type": "string" },
        "cc": { "type": "string" },
        "bcc": { "type": "string" },
        "subject": { "type": "string" },
        "body": { "type": "string" }
      }
    },
    "args": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "interpreter": { "type": "string" },
        "timeout": { "type": "integer", "minimum": 1 },
        "cwd": { "type": "string" },
        "template": { "type": "string" },
        "templating": { "type": "boolean" },
        "file_uploads": { "type": "boolean" }
      }
    },
    "with": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "auth_basic": {
          "type": "array",
          "items": {
            "type": "object",
            "required": ["username", "password"],
            "additionalProperties": false,
            "properties": {
              "username": { "type": "string" },
              "password": { "type": "string" }
            }
          }
        },
        "auth_hashing": { "type": "string", "enum": ["", "none", "sha256", "sha512"] },
        "max_request_body": { "type": "string" }
      }
    },
    "respond": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "on_success": { "$ref": "#/definitions/response" },
        "on_error": { "$ref": "#/definitions/response" }
      }
    },
    "response": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "http_status": { "type": "integer", "minimum": 0, "maximum": 599 },
        "body": { "type": "string" },
        "headers": {
          "type": "object",
          "additionalProperties": { "type": "string" }
        }
      }
    }
  }
}"##;

// ---------- Built-in page of the render.buttons action ----------
pub const BUTTONS_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{{ Title | e }}</title>
  <style>
    body { font-family: sans-serif; margin: 2rem auto; max-width: 40rem; }
    .button { display: block; margin: 0.5rem 0; padding: 0.75rem 1rem; border: 1px solid #444;
              border-radius: 4px; color: #111; text-align: center; text-decoration: none; }
    .button:hover { background: #eee; }
    .btn-lg { font-size: 1.25rem; padding: 1rem 1.25rem; }
  </style>
</head>
<body>
  <h1>{{ Title | e }}</h1>
{% for button in Buttons %}  <a class="button {{ button.Classes | e }}" href="{{ button.URL | e }}">{{ button.Name | e }}</a>
{% endfor %}</body>
</html>
"#;
