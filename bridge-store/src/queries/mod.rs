mod bindings;
mod employees;
mod messages;
mod platforms;
mod tasks;
