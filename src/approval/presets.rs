//! Static preset catalogues offered by the selection wizards.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StackPreset {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub frontend: &'static str,
    pub backend: &'static str,
    pub database: &'static str,
    pub deployment: &'static str,
    pub architecture_pattern: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresetPackage {
    pub name: &'static str,
    pub version: &'static str,
    pub purpose: &'static str,
    pub ecosystem: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyPreset {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub packages: &'static [PresetPackage],
}

pub const STACK_PRESETS: &[StackPreset] = &[
    StackPreset {
        id: "nextjs-fullstack",
        label: "Next.js full stack",
        description: "Single TypeScript codebase with server components and API routes.",
        frontend: "Next.js (React, TypeScript)",
        backend: "Next.js route handlers",
        database: "PostgreSQL",
        deployment: "Vercel",
        architecture_pattern: "Monolith with server components",
    },
    StackPreset {
        id: "react-node-postgres",
        label: "React + Node.js + PostgreSQL",
        description: "SPA talking to a separate REST API.",
        frontend: "React (Vite, TypeScript)",
        backend: "Node.js (Express)",
        database: "PostgreSQL",
        deployment: "Docker on a managed container host",
        architecture_pattern: "Layered REST API",
    },
    StackPreset {
        id: "sveltekit-sqlite",
        label: "SvelteKit + SQLite",
        description: "Lightweight stack for small teams and internal tools.",
        frontend: "SvelteKit",
        backend: "SvelteKit server endpoints",
        database: "SQLite",
        deployment: "Single VM",
        architecture_pattern: "Monolith",
    },
    StackPreset {
        id: "django-htmx",
        label: "Django + HTMX",
        description: "Server-rendered Python web app with progressive enhancement.",
        frontend: "Django templates with HTMX",
        backend: "Django (Python)",
        database: "PostgreSQL",
        deployment: "Docker",
        architecture_pattern: "MVC monolith",
    },
    StackPreset {
        id: "rust-axum-react",
        label: "Rust (axum) + React",
        description: "Typed Rust API service with a React front end.",
        frontend: "React (Vite, TypeScript)",
        backend: "Rust (axum, tokio)",
        database: "PostgreSQL",
        deployment: "Docker",
        architecture_pattern: "Service with hexagonal core",
    },
];

pub const DEPENDENCY_PRESETS: &[DependencyPreset] = &[
    DependencyPreset {
        id: "web-essentials-ts",
        label: "TypeScript web essentials",
        description: "Validation, data access and testing for a TypeScript web app.",
        packages: &[
            PresetPackage {
                name: "zod",
                version: "^3",
                purpose: "Runtime schema validation",
                ecosystem: "npm",
            },
            PresetPackage {
                name: "drizzle-orm",
                version: "^0.30",
                purpose: "Type-safe SQL access",
                ecosystem: "npm",
            },
            PresetPackage {
                name: "vitest",
                version: "^1",
                purpose: "Unit testing",
                ecosystem: "npm",
            },
            PresetPackage {
                name: "playwright",
                version: "^1",
                purpose: "End-to-end testing",
                ecosystem: "npm",
            },
        ],
    },
    DependencyPreset {
        id: "node-api",
        label: "Node.js REST API",
        description: "HTTP server, logging and database driver for an Express API.",
        packages: &[
            PresetPackage {
                name: "express",
                version: "^4",
                purpose: "HTTP server",
                ecosystem: "npm",
            },
            PresetPackage {
                name: "pino",
                version: "^9",
                purpose: "Structured logging",
                ecosystem: "npm",
            },
            PresetPackage {
                name: "pg",
                version: "^8",
                purpose: "PostgreSQL driver",
                ecosystem: "npm",
            },
        ],
    },
    DependencyPreset {
        id: "python-web",
        label: "Python web",
        description: "Django with REST support and testing.",
        packages: &[
            PresetPackage {
                name: "django",
                version: ">=5.0",
                purpose: "Web framework",
                ecosystem: "pypi",
            },
            PresetPackage {
                name: "djangorestframework",
                version: ">=3.15",
                purpose: "REST endpoints",
                ecosystem: "pypi",
            },
            PresetPackage {
                name: "pytest-django",
                version: ">=4.8",
                purpose: "Testing",
                ecosystem: "pypi",
            },
        ],
    },
    DependencyPreset {
        id: "rust-service",
        label: "Rust service",
        description: "Async HTTP service with SQL access and tracing.",
        packages: &[
            PresetPackage {
                name: "axum",
                version: "0.8",
                purpose: "HTTP routing",
                ecosystem: "crates.io",
            },
            PresetPackage {
                name: "tokio",
                version: "1",
                purpose: "Async runtime",
                ecosystem: "crates.io",
            },
            PresetPackage {
                name: "sqlx",
                version: "0.8",
                purpose: "Async SQL access",
                ecosystem: "crates.io",
            },
            PresetPackage {
                name: "tracing",
                version: "0.1",
                purpose: "Structured logging",
                ecosystem: "crates.io",
            },
        ],
    },
];

pub fn stack_preset(id: &str) -> Option<&'static StackPreset> {
    STACK_PRESETS.iter().find(|p| p.id == id)
}

pub fn dependency_preset(id: &str) -> Option<&'static DependencyPreset> {
    DEPENDENCY_PRESETS.iter().find(|p| p.id == id)
}
