// API endpoint handlers

pub mod gemini;
